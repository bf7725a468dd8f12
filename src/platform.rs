// Replaces the teacher's global singletons (EV_SELECT, CPU model, MMIO base
// tables) with a plain value passed by reference into every component, per
// the DESIGN NOTES in spec.md §9. Grounded in
// examples/original_source/AEJ/constants/constMMIOAddress.h and
// AEJ/EvSelect.h for the per-generation window layout.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    Ev4,
    Ev5,
    Ev56,
    Ev6,
    Ev67,
    Ev7,
}

impl Generation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ev4 => "EV4",
            Self::Ev5 => "EV5",
            Self::Ev56 => "EV56",
            Self::Ev6 => "EV6",
            Self::Ev67 => "EV67",
            Self::Ev7 => "EV7",
        }
    }

    /// Number of IPRs implemented by this generation's PAL-visible register set.
    pub fn ipr_count(self) -> usize {
        match self {
            Self::Ev4 | Self::Ev5 | Self::Ev56 => 32,
            Self::Ev6 | Self::Ev67 => 48,
            Self::Ev7 => 64,
        }
    }
}

/// Physical-address window above which accesses are routed to the
/// Device/MMIO collaborator instead of physical memory / the cache hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct MmioWindow {
    pub base: u64,
    pub len: u64,
}

impl MmioWindow {
    pub fn contains(&self, pa: u64) -> bool {
        pa >= self.base && pa < self.base + self.len
    }
}

#[derive(Debug, Clone)]
pub struct PlatformProfile {
    pub generation: Generation,
    pub mmio_windows: Vec<MmioWindow>,
    pub cpu_count: usize,
}

impl PlatformProfile {
    pub fn new(generation: Generation, cpu_count: usize) -> Self {
        let mmio_windows = match generation {
            // Each generation's window base shifts as later chipsets grew the
            // physical address space reserved for I/O (EvSelect.h).
            Generation::Ev4 => vec![MmioWindow { base: 0x0000_1000_0000, len: 0x1000_0000 }],
            Generation::Ev5 | Generation::Ev56 => {
                vec![MmioWindow { base: 0x0000_1800_0000, len: 0x1000_0000 }]
            }
            Generation::Ev6 | Generation::Ev67 => {
                vec![MmioWindow { base: 0x0001_8000_0000, len: 0x2000_0000 }]
            }
            Generation::Ev7 => vec![MmioWindow { base: 0x0002_0000_0000, len: 0x4000_0000 }],
        };
        Self { generation, mmio_windows, cpu_count }
    }

    pub fn is_mmio(&self, pa: u64) -> bool {
        self.mmio_windows.iter().any(|w| w.contains(pa))
    }
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self::new(Generation::Ev6, 1)
    }
}
