//! This module contains the definitions of functions and structures.
//!
//! The km winapi branch only covers a part of the wdm surface, so every
//! routine and structure it misses is declared here. Structures are laid out
//! for x86_64; the driver only builds for that target.

#![allow(bad_style)]
#![allow(missing_docs)]

use winapi::shared::ntdef::{HANDLE, LIST_ENTRY, NTSTATUS, PVOID, UNICODE_STRING};

pub type PEPROCESS = PVOID;
pub type KPROCESSOR_MODE = i8;

pub const KERNEL_MODE: KPROCESSOR_MODE = 0;

pub const IRP_MJ_CREATE: usize = 0x00;
pub const IRP_MJ_CLOSE: usize = 0x02;
pub const IRP_MJ_DEVICE_CONTROL: usize = 0x0e;
pub const IRP_MJ_MAXIMUM_FUNCTION: usize = 0x1b;

pub const DO_BUFFERED_IO: u32 = 0x0000_0004;
pub const DO_DEVICE_INITIALIZING: u32 = 0x0000_0080;

pub const FILE_DEVICE_SECURE_OPEN: u32 = 0x0000_0100;

pub const IO_NO_INCREMENT: i8 = 0;

pub const NON_PAGED_POOL: u32 = 0;

pub const NORMAL_PAGE_PRIORITY: u32 = 16;

pub const PAGE_READWRITE: u32 = 0x04;

// See: https://docs.microsoft.com/en-us/windows-hardware/drivers/debugger/bug-check-code-reference2#bug-check-codes
pub const MANUALLY_INITIATED_CRASH: u32 = 0x0000_00E2;

pub type DriverDispatchFn =
    unsafe extern "system" fn(device: *mut DEVICE_OBJECT, irp: *mut IRP) -> NTSTATUS;
pub type DriverUnloadFn = unsafe extern "system" fn(driver: *mut DRIVER_OBJECT);

#[repr(C)]
pub struct DRIVER_OBJECT {
    pub Type: i16,
    pub Size: i16,
    pub DeviceObject: *mut DEVICE_OBJECT,
    pub Flags: u32,
    pub DriverStart: PVOID,
    pub DriverSize: u32,
    pub DriverSection: PVOID,
    pub DriverExtension: PVOID,
    pub DriverName: UNICODE_STRING,
    pub HardwareDatabase: *mut UNICODE_STRING,
    pub FastIoDispatch: PVOID,
    pub DriverInit: PVOID,
    pub DriverStartIo: PVOID,
    pub DriverUnload: Option<DriverUnloadFn>,
    pub MajorFunction: [Option<DriverDispatchFn>; IRP_MJ_MAXIMUM_FUNCTION + 1],
}

/// Leading fields of `DEVICE_OBJECT`. The queue and wait-block tail is never
/// touched, so it is kept opaque.
#[repr(C)]
pub struct DEVICE_OBJECT {
    pub Type: i16,
    pub Size: u16,
    pub ReferenceCount: i32,
    pub DriverObject: *mut DRIVER_OBJECT,
    pub NextDevice: *mut DEVICE_OBJECT,
    pub AttachedDevice: *mut DEVICE_OBJECT,
    pub CurrentIrp: *mut IRP,
    pub Timer: PVOID,
    pub Flags: u32,
    pub Characteristics: u32,
    pub Vpb: PVOID,
    pub DeviceExtension: PVOID,
    pub DeviceType: u32,
    pub StackSize: i8,
    _opaque: [u8; 0xC7],
}

#[repr(C)]
pub struct IO_STATUS_BLOCK {
    /// Overlaps `Pointer` in the original union; the padding the pointer arm
    /// forces is inserted by the aligned field that follows.
    pub Status: NTSTATUS,
    pub Information: usize,
}

#[repr(C)]
pub union IRP_ASSOCIATED_IRP {
    pub MasterIrp: *mut IRP,
    pub IrpCount: i32,
    pub SystemBuffer: PVOID,
}

#[repr(C)]
pub struct IRP_TAIL_OVERLAY {
    pub DriverContext: [PVOID; 4],
    pub Thread: PVOID,
    pub AuxiliaryBuffer: *mut i8,
    pub ListEntry: LIST_ENTRY,
    pub CurrentStackLocation: *mut IO_STACK_LOCATION,
    pub OriginalFileObject: PVOID,
    /// Pads the overlay to the size of the `Apc` union arm.
    _apc_tail: u64,
}

/// `IRP` for x86_64, down to the fields the dispatcher needs. The tail union
/// is represented by its overlay arm only; this driver never queues APCs on
/// an IRP.
#[repr(C)]
pub struct IRP {
    pub Type: u16,
    pub Size: u16,
    _pad0: u32,
    pub MdlAddress: PMDL,
    pub Flags: u32,
    _pad1: u32,
    pub AssociatedIrp: IRP_ASSOCIATED_IRP,
    pub ThreadListEntry: LIST_ENTRY,
    pub IoStatus: IO_STATUS_BLOCK,
    pub RequestorMode: KPROCESSOR_MODE,
    pub PendingReturned: u8,
    pub StackCount: i8,
    pub CurrentLocation: i8,
    pub Cancel: u8,
    pub CancelIrql: u8,
    pub ApcEnvironment: i8,
    pub AllocationFlags: u8,
    pub UserIosb: PVOID,
    pub UserEvent: PVOID,
    pub Overlay: [u64; 2],
    pub CancelRoutine: PVOID,
    pub UserBuffer: PVOID,
    pub Tail: IRP_TAIL_OVERLAY,
}

/// `Parameters.DeviceIoControl` of `IO_STACK_LOCATION`. Each `u32` is
/// pointer-aligned in the original union, hence the explicit padding.
#[repr(C)]
pub struct DEVICE_IO_CONTROL_PARAMETERS {
    pub OutputBufferLength: u32,
    _pad0: u32,
    pub InputBufferLength: u32,
    _pad1: u32,
    pub IoControlCode: u32,
    _pad2: u32,
    pub Type3InputBuffer: PVOID,
}

/// `IO_STACK_LOCATION` with the parameters union fixed to the device-control
/// arm, which is as large as the union itself (four pointers).
#[repr(C)]
pub struct IO_STACK_LOCATION {
    pub MajorFunction: u8,
    pub MinorFunction: u8,
    pub Flags: u8,
    pub Control: u8,
    pub Parameters: DEVICE_IO_CONTROL_PARAMETERS,
    pub DeviceObject: *mut DEVICE_OBJECT,
    pub FileObject: PVOID,
    pub CompletionRoutine: PVOID,
    pub Context: PVOID,
}

/// `IoGetCurrentIrpStackLocation` is a macro in the WDK; the current location
/// pointer lives in the IRP tail.
pub unsafe fn IoGetCurrentIrpStackLocation(irp: *const IRP) -> *mut IO_STACK_LOCATION {
    (*irp).Tail.CurrentStackLocation
}

#[repr(C)]
pub struct MDL {
    pub Next: *mut MDL,
    pub Size: i16,
    pub MdlFlags: i16,
    _pad0: u32,
    pub Process: PVOID,
    pub MappedSystemVa: PVOID,
    pub StartVa: PVOID,
    pub ByteCount: u32,
    pub ByteOffset: u32,
}
pub type PMDL = *mut MDL;

#[repr(C)]
pub struct KAPC_STATE {
    pub ApcListHead: [LIST_ENTRY; 2],
    pub Process: PEPROCESS,
    pub InProgressFlags: u8,
    pub KernelApcPending: u8,
    pub UserApcPending: u8,
    _pad0: [u8; 5],
}

#[repr(C)]
pub enum LOCK_OPERATION {
    IoReadAccess = 0,
    IoWriteAccess = 1,
    IoModifyAccess = 2,
}

#[repr(C)]
pub enum MEMORY_CACHING_TYPE {
    MmNonCached = 0,
    MmCached = 1,
    MmWriteCombined = 2,
    MmHardwareCoherentCached,
    MmNonCachedUnordered,
    MmUSWCCached,
    MmMaximumCacheType,
    MmNotMapped = -1,
}

extern "system" {
    pub static MmHighestUserAddress: PVOID;

    pub fn IoCreateDevice(
        DriverObject: *mut DRIVER_OBJECT,
        DeviceExtensionSize: u32,
        DeviceName: *mut UNICODE_STRING,
        DeviceType: u32,
        DeviceCharacteristics: u32,
        Exclusive: u8,
        DeviceObject: *mut *mut DEVICE_OBJECT,
    ) -> NTSTATUS;

    pub fn IoDeleteDevice(DeviceObject: *mut DEVICE_OBJECT);

    pub fn IoCreateSymbolicLink(
        SymbolicLinkName: *mut UNICODE_STRING,
        DeviceName: *mut UNICODE_STRING,
    ) -> NTSTATUS;

    pub fn IoDeleteSymbolicLink(SymbolicLinkName: *mut UNICODE_STRING) -> NTSTATUS;

    pub fn IofCompleteRequest(Irp: *mut IRP, PriorityBoost: i8);

    pub fn RtlInitUnicodeString(DestinationString: *mut UNICODE_STRING, SourceString: *const u16);

    pub fn MmGetSystemRoutineAddress(SystemRoutineName: *mut UNICODE_STRING) -> PVOID;

    pub fn PsLookupProcessByProcessId(ProcessId: HANDLE, Process: *mut PEPROCESS) -> NTSTATUS;

    pub fn ObfDereferenceObject(Object: PVOID) -> isize;

    pub fn IoGetCurrentProcess() -> PEPROCESS;

    pub fn KeStackAttachProcess(Process: PEPROCESS, ApcState: *mut KAPC_STATE);

    pub fn KeUnstackDetachProcess(ApcState: *mut KAPC_STATE);

    pub fn IoAllocateMdl(
        VirtualAddress: PVOID,
        Length: u32,
        SecondaryBuffer: u8,
        ChargeQuota: u8,
        Irp: *mut IRP,
    ) -> PMDL;

    pub fn IoFreeMdl(Mdl: PMDL);

    pub fn MmProbeAndLockPages(Mdl: PMDL, AccessMode: KPROCESSOR_MODE, Operation: LOCK_OPERATION);

    pub fn MmUnlockPages(Mdl: PMDL);

    pub fn MmMapLockedPagesSpecifyCache(
        Mdl: PMDL,
        AccessMode: KPROCESSOR_MODE,
        CacheType: MEMORY_CACHING_TYPE,
        RequestedAddress: PVOID,
        BugCheckOnFailure: u32,
        Priority: u32,
    ) -> PVOID;

    pub fn MmUnmapLockedPages(BaseAddress: PVOID, Mdl: PMDL);

    pub fn MmProtectMdlSystemAddress(Mdl: PMDL, NewProtect: u32) -> NTSTATUS;

    pub fn MmIsAddressValid(VirtualAddress: PVOID) -> u8;

    pub fn ExAllocatePoolWithTag(PoolType: u32, NumberOfBytes: usize, Tag: u32) -> PVOID;

    pub fn ExFreePool(P: PVOID);

    pub fn KeBugCheck(BugCheckCode: u32) -> !;
}
