/// Observer for per-file progress of a run.
pub trait Progress: Send {
    fn start(&mut self, label: &str, total: usize);
    fn increment(&mut self, n: usize);
    fn finish(&mut self);
}

/// Reports progress through `tracing`.
#[derive(Debug, Default)]
pub struct LogProgress {
    label: String,
    total: usize,
    current: usize,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.current
    }
}

impl Progress for LogProgress {
    fn start(&mut self, label: &str, total: usize) {
        self.label = label.to_string();
        self.total = total;
        self.current = 0;
        tracing::info!(total, "{}", self.label);
    }

    fn increment(&mut self, n: usize) {
        self.current += n;
        tracing::debug!(current = self.current, total = self.total, "{}", self.label);
    }

    fn finish(&mut self) {
        tracing::info!(processed = self.current, total = self.total, "{} done", self.label);
    }
}
