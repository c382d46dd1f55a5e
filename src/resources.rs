use serde::{Deserialize, Serialize};

/// Tolerance for floating-point memory accounting. Allocations are sums and
/// differences of generated values, so exact zero is not guaranteed.
pub const MEMORY_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu: u32,
    pub gpu: u32,
    pub memory: f64,
}

impl ResourceVector {
    pub fn new(cpu: u32, gpu: u32, memory: f64) -> Self {
        Self { cpu, gpu, memory }
    }

    pub fn fits_into(&self, other: &ResourceVector) -> bool {
        self.cpu <= other.cpu
            && self.gpu <= other.gpu
            && self.memory <= other.memory + MEMORY_EPSILON
    }

    pub fn add(&mut self, other: &ResourceVector) {
        self.cpu += other.cpu;
        self.gpu += other.gpu;
        self.memory += other.memory;
    }

    pub fn subtract(&mut self, other: &ResourceVector) {
        self.cpu -= other.cpu;
        self.gpu -= other.gpu;
        self.memory -= other.memory;
        if self.memory < 0. {
            assert!(
                self.memory > -MEMORY_EPSILON,
                "memory accounting went negative: {}",
                self.memory
            );
            self.memory = 0.;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.gpu == 0 && self.memory.abs() < MEMORY_EPSILON
    }

    /// L1 magnitude used by best-fit / worst-fit leftover comparisons.
    pub fn magnitude(&self) -> f64 {
        self.cpu as f64 + self.gpu as f64 + self.memory
    }
}
