//! LIFO phase stack shared by the orchestrator and every stage.

/// A stack of phases that is never empty.
///
/// The root phase passed to [`Navigator::new`] can only be replaced through
/// [`Navigator::reset`]; [`Navigator::pop`] refuses to remove the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigator<P: Copy + Eq> {
    stack: Vec<P>,
}

impl<P: Copy + Eq> Navigator<P> {
    pub fn new(root: P) -> Self {
        Self { stack: vec![root] }
    }

    pub fn push(&mut self, phase: P) {
        self.stack.push(phase);
    }

    /// Removes the current phase. Returns false and leaves the stack alone
    /// when only the root remains.
    pub fn pop(&mut self) -> bool {
        if self.stack.len() <= 1 {
            return false;
        }
        self.stack.pop();
        true
    }

    pub fn current(&self) -> P {
        // The stack is created with one element and pop never removes the last.
        self.stack[self.stack.len() - 1]
    }

    pub fn reset(&mut self, phase: P) {
        self.stack.clear();
        self.stack.push(phase);
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}
