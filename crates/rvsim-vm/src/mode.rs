//! Privilege-mode enumerations.

/// Base privilege mode. Discriminants match the architectural encoding so
/// they double as bit positions in per-mode masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BaseMode {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl BaseMode {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit in a TLB entry's `mapped` mask.
    #[inline]
    pub fn mask(self) -> u8 {
        1 << (self as u8)
    }

    pub fn name(self) -> &'static str {
        match self {
            BaseMode::User => "User",
            BaseMode::Supervisor => "Supervisor",
            BaseMode::Machine => "Machine",
        }
    }
}

/// Five-state privilege mode: base mode plus virtualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode5 {
    User,
    Supervisor,
    Machine,
    VirtUser,
    VirtSupervisor,
}

impl Mode5 {
    #[inline]
    pub fn base(self) -> BaseMode {
        match self {
            Mode5::User | Mode5::VirtUser => BaseMode::User,
            Mode5::Supervisor | Mode5::VirtSupervisor => BaseMode::Supervisor,
            Mode5::Machine => BaseMode::Machine,
        }
    }

    #[inline]
    pub fn is_virtual(self) -> bool {
        matches!(self, Mode5::VirtUser | Mode5::VirtSupervisor)
    }

    /// Which virtual-domain slot this mode translates through, if any.
    pub fn vm_mode(self) -> Option<VmMode> {
        match self {
            Mode5::User => Some(VmMode::User),
            Mode5::Supervisor => Some(VmMode::Supervisor),
            Mode5::VirtUser => Some(VmMode::VirtUser),
            Mode5::VirtSupervisor => Some(VmMode::VirtSupervisor),
            Mode5::Machine => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode5::User => "User",
            Mode5::Supervisor => "Supervisor",
            Mode5::Machine => "Machine",
            Mode5::VirtUser => "Virtual User",
            Mode5::VirtSupervisor => "Virtual Supervisor",
        }
    }

    /// All modes, in the order domain identification scans them (highest
    /// first, virtualized modes before base modes).
    pub const SCAN_ORDER: [Mode5; 5] = [
        Mode5::VirtSupervisor,
        Mode5::VirtUser,
        Mode5::Machine,
        Mode5::Supervisor,
        Mode5::User,
    ];
}

/// Index of a virtual (translated) domain pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmMode {
    User = 0,
    Supervisor = 1,
    VirtUser = 2,
    VirtSupervisor = 3,
}

impl VmMode {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn mode5(self) -> Mode5 {
        match self {
            VmMode::User => Mode5::User,
            VmMode::Supervisor => Mode5::Supervisor,
            VmMode::VirtUser => Mode5::VirtUser,
            VmMode::VirtSupervisor => Mode5::VirtSupervisor,
        }
    }

    pub const ALL: [VmMode; 4] = [
        VmMode::User,
        VmMode::Supervisor,
        VmMode::VirtUser,
        VmMode::VirtSupervisor,
    ];
}
