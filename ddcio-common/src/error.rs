use std::fmt::{self, Write};

use crate::Status;

/// A status code, the name of the function that minted it, and the ordered list of
/// statuses that caused it.
///
/// Nodes are moved into their parent when chained. A retry failure has one cause per
/// attempt, in attempt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNode {
    status: Status,
    func: &'static str,
    detail: Option<String>,
    causes: Vec<ErrorNode>,
}

impl ErrorNode {
    pub fn new(status: Status, func: &'static str) -> Self {
        Self { status, func, detail: None, causes: Vec::new() }
    }

    /// Creates a node whose causes are leaf nodes for each of `statuses`, all attributed to
    /// `func`.
    pub fn with_causes(
        status: Status,
        func: &'static str,
        statuses: impl IntoIterator<Item = Status>,
    ) -> Self {
        let causes = statuses.into_iter().map(|s| Self::new(s, func)).collect();
        Self { status, func, detail: None, causes }
    }

    /// Wraps `child` in a new node that adopts the child's status and names `func` as its
    /// origin.
    pub fn wrap(child: Self, func: &'static str) -> Self {
        Self { status: child.status, func, detail: None, causes: vec![child] }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn add_cause(&mut self, cause: Self) {
        self.causes.push(cause);
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn func(&self) -> &'static str {
        self.func
    }

    #[inline]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    #[inline]
    pub fn causes(&self) -> &[ErrorNode] {
        &self.causes
    }

    /// The statuses of the direct causes, in order.
    pub fn cause_statuses(&self) -> Vec<Status> {
        self.causes.iter().map(|c| c.status).collect()
    }

    /// One-line rendering: `RetriesExhausted(EIO, EIO, EIO)`.
    pub fn summary(&self) -> String {
        let mut out = String::from(self.status.name());
        if !self.causes.is_empty() {
            out.push('(');
            for (i, cause) in self.causes.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(cause.status.name());
            }
            out.push(')');
        }
        out
    }

    /// Multi-line rendering of the whole tree, one node per line, indented by depth.
    pub fn report(&self) -> String {
        let mut out = String::new();
        self.report_into(&mut out, 0);
        out
    }

    fn report_into(&self, out: &mut String, depth: usize) {
        let _ = write!(
            out,
            "{:indent$}{} in {} ({})",
            "",
            self.status.name(),
            self.func,
            self.status.code(),
            indent = depth * 2
        );
        if let Some(detail) = &self.detail {
            let _ = write!(out, ": {detail}");
        }
        out.push('\n');
        for cause in &self.causes {
            cause.report_into(out, depth + 1);
        }
    }
}

impl fmt::Display for ErrorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.func, self.status)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorNode {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes.last().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorNode> for Status {
    fn from(e: ErrorNode) -> Self {
        e.status
    }
}
