/// Point-in-time resource snapshot of a supervised process group.
#[derive(Debug, Clone, Default)]
pub struct ProcessStatistics {
    pub kernel_cpu_ms: u64,
    pub user_cpu_ms: u64,
    /// Memory high-water mark in KiB.
    pub memory_kb: u64,
    /// Pids currently alive in the group.
    pub process_ids: Vec<i32>,
    /// True only when every pid in the group has exited.
    pub terminated: bool,
}

impl ProcessStatistics {
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}
