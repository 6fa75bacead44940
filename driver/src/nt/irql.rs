pub type KIRQL = u8;

extern "system" {
    pub fn KeGetCurrentIrql() -> KIRQL;
}

/// Passive release level
pub const PASSIVE_LEVEL: KIRQL = 0;
/// APC interrupt level
pub const APC_LEVEL: KIRQL = 1;
/// Dispatcher level
pub const DISPATCH_LEVEL: KIRQL = 2;

/// Asserts that the current IRQL allows touching pageable data.
#[macro_export]
macro_rules! assert_paged_code {
    () => {
        #[cfg(not(feature = "no-assertions"))]
        assert!(
            unsafe { $crate::nt::irql::KeGetCurrentIrql() } <= $crate::nt::irql::APC_LEVEL,
            "Called at IRQL > APC_LEVEL",
        );
    };
}
