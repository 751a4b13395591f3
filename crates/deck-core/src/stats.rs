use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MemoryStats {
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuStats {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vram: MemoryStats,
    #[serde(default)]
    pub utilization_percent: f64,
}

impl GpuStats {
    pub fn free_vram(&self) -> u64 {
        self.vram.total.saturating_sub(self.vram.used)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemStats {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub ram: MemoryStats,
    #[serde(default)]
    pub gpus: Vec<GpuStats>,
}

impl SystemStats {
    /// GPU with the most free VRAM; the first one wins ties.
    pub fn best_gpu(&self) -> Option<u32> {
        let mut best: Option<&GpuStats> = None;
        for gpu in &self.gpus {
            match best {
                Some(current) if gpu.free_vram() <= current.free_vram() => {}
                _ => best = Some(gpu),
            }
        }
        best.map(|gpu| gpu.id)
    }
}
