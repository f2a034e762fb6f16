/// The Machine: portable state owned for the lifetime of the system.
///
/// Created exactly once by the boot sequencer from the free memory it
/// discovered, then initialized, which is where the heap comes up. The
/// instance lives in a [`MachineSlot`], a set-once cell: a second `create`
/// is an error and asking for the machine before it exists is fatal.
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, Once};

use crate::config::KernelConfig;
use crate::mem::{Heap, HeapError, HeapLayout, MemoryMap, MemoryMapError, MemoryRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineError {
    AlreadyCreated,
    AlreadyInitialized,
    EmptyMemory,
    AddressOverflow,
    Heap(HeapError),
    MemoryMap(MemoryMapError),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineError::AlreadyCreated => write!(f, "machine already created"),
            MachineError::AlreadyInitialized => write!(f, "machine already initialized"),
            MachineError::EmptyMemory => write!(f, "no free memory to build the machine on"),
            MachineError::AddressOverflow => write!(f, "machine memory overflows the address space"),
            MachineError::Heap(e) => write!(f, "heap: {}", e),
            MachineError::MemoryMap(e) => write!(f, "memory map: {}", e),
        }
    }
}

impl From<HeapError> for MachineError {
    fn from(e: HeapError) -> Self {
        MachineError::Heap(e)
    }
}

impl From<MemoryMapError> for MachineError {
    fn from(e: MemoryMapError) -> Self {
        MachineError::MemoryMap(e)
    }
}

pub struct Machine {
    memory: MemoryRegion,
    heap: &'static Heap,
    config: KernelConfig,
    memory_map: Mutex<MemoryMap>,
    initialized: AtomicBool,
}

impl Machine {
    fn new(
        free_start: usize,
        size: usize,
        heap: &'static Heap,
        config: KernelConfig,
        reserved: &[(&'static str, MemoryRegion)],
    ) -> Result<Self, MachineError> {
        if size == 0 {
            return Err(MachineError::EmptyMemory);
        }
        let end = free_start.checked_add(size).ok_or(MachineError::AddressOverflow)?;

        let mut map = MemoryMap::new();
        for &(name, region) in reserved {
            map.assign(name, region)?;
        }

        Ok(Self {
            memory: MemoryRegion::new(free_start, end),
            heap,
            config,
            memory_map: Mutex::new(map),
            initialized: AtomicBool::new(false),
        })
    }

    /// Portable initialization: bring up the heap over the machine's memory
    /// and record both heap regions in the memory map.
    ///
    /// The regions are checked against the map before the heap is touched,
    /// so a failure leaves both the heap and the machine uninitialized.
    pub fn init(&self) -> Result<HeapLayout, MachineError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(MachineError::AlreadyInitialized);
        }
        match self.bring_up_heap() {
            Ok(layout) => Ok(layout),
            Err(e) => {
                self.initialized.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn bring_up_heap(&self) -> Result<HeapLayout, MachineError> {
        let plan = HeapLayout::plan(self.memory.begin, self.memory.end, self.config.brk_max)?;

        let mut map = self.memory_map.lock();
        let mut updated = map.clone();
        updated.assign("heap brk", plan.brk_region())?;
        updated.assign("heap mmap", plan.mmap_region())?;

        let layout = self
            .heap
            .init_heap(self.memory.begin, self.memory.end, self.config.brk_max)?;
        *map = updated;

        log::info!(
            "machine: {:#x}..{:#x} ({} KiB free)",
            self.memory.begin,
            self.memory.end,
            self.memory.size() / 1024
        );
        Ok(layout)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Free memory handed to the machine at creation.
    pub fn memory(&self) -> MemoryRegion {
        self.memory
    }

    pub fn heap(&self) -> &'static Heap {
        self.heap
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Reserve another named range. Fails if it overlaps anything recorded.
    pub fn reserve(&self, name: &'static str, region: MemoryRegion) -> Result<(), MachineError> {
        self.memory_map.lock().assign(name, region)?;
        Ok(())
    }

    /// Run `f` with the memory map locked.
    pub fn with_memory_map<R>(&self, f: impl FnOnce(&MemoryMap) -> R) -> R {
        f(&self.memory_map.lock())
    }
}

/// Set-once home of the Machine.
pub struct MachineSlot {
    claimed: AtomicBool,
    machine: Once<Machine>,
}

impl MachineSlot {
    pub const fn new() -> Self {
        Self { claimed: AtomicBool::new(false), machine: Once::new() }
    }

    /// Build the machine over `[free_start, free_start + size)`.
    ///
    /// `reserved` names ranges already in use (image, relocated symbols) so
    /// that later assignments are checked against them.
    pub fn create(
        &'static self,
        free_start: usize,
        size: usize,
        heap: &'static Heap,
        config: KernelConfig,
        reserved: &[(&'static str, MemoryRegion)],
    ) -> Result<&'static Machine, MachineError> {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Err(MachineError::AlreadyCreated);
        }
        let machine = match Machine::new(free_start, size, heap, config, reserved) {
            Ok(m) => m,
            Err(e) => {
                self.claimed.store(false, Ordering::Release);
                return Err(e);
            }
        };
        Ok(self.machine.call_once(|| machine))
    }

    pub fn get(&self) -> Option<&Machine> {
        self.machine.get()
    }

    /// The machine. Fatal if it has not been created.
    pub fn machine(&self) -> &Machine {
        match self.machine.get() {
            Some(m) => m,
            None => panic!("machine used before Machine::create"),
        }
    }
}

pub static MACHINE: MachineSlot = MachineSlot::new();

/// The system's machine. Fatal before the boot sequencer has created it.
pub fn machine() -> &'static Machine {
    MACHINE.machine()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PAGE_SIZE;

    fn slot() -> &'static MachineSlot {
        Box::leak(Box::new(MachineSlot::new()))
    }

    fn heap() -> &'static Heap {
        Box::leak(Box::new(Heap::new()))
    }

    #[test]
    fn create_once() {
        let slot = slot();
        let cfg = KernelConfig::DEFAULT;
        let m = slot.create(0x20_0000, 0x800_0000, heap(), cfg, &[]).unwrap();
        assert_eq!(m.memory(), MemoryRegion::new(0x20_0000, 0x820_0000));
        assert!(matches!(
            slot.create(0x20_0000, 0x800_0000, heap(), cfg, &[]),
            Err(MachineError::AlreadyCreated)
        ));
        assert!(core::ptr::eq(slot.machine(), m));
    }

    #[test]
    #[should_panic(expected = "machine used before Machine::create")]
    fn use_before_create_is_fatal() {
        slot().machine();
    }

    #[test]
    fn failed_create_leaves_slot_empty() {
        let slot = slot();
        let cfg = KernelConfig::DEFAULT;
        assert!(matches!(slot.create(0x1000, 0, heap(), cfg, &[]), Err(MachineError::EmptyMemory)));
        assert!(slot.get().is_none());
        assert!(slot.create(0x20_0000, 0x400_0000, heap(), cfg, &[]).is_ok());
    }

    #[test]
    fn init_brings_up_heap_and_maps_regions() {
        let slot = slot();
        let heap = heap();
        let cfg = KernelConfig { brk_max: 0x10_0000, ..KernelConfig::DEFAULT };
        let reserved = [("image", MemoryRegion::new(0x10_0000, 0x18_0000))];
        let m = slot.create(0x18_0000, 0x400_0000, heap, cfg, &reserved).unwrap();

        assert!(!heap.heap_ready());
        let layout = m.init().unwrap();
        assert!(heap.heap_ready());
        assert!(m.is_initialized());
        assert_eq!(layout.heap_begin, 0x18_0000);

        m.with_memory_map(|map| {
            assert_eq!(map.get("heap brk"), Some(MemoryRegion::new(0x18_0000, 0x28_0000)));
            assert_eq!(map.get("heap mmap").map(|r| r.begin), Some(0x28_0000));
        });
        assert!(matches!(m.init(), Err(MachineError::AlreadyInitialized)));
        assert!(matches!(
            m.reserve("overlay", MemoryRegion::new(0x27_0000, 0x27_0000 + PAGE_SIZE)),
            Err(MachineError::MemoryMap(MemoryMapError::Overlap { existing: "heap brk", .. }))
        ));
    }

    #[test]
    fn reserved_ranges_must_not_overlap() {
        let reserved = [
            ("image", MemoryRegion::new(0x10_0000, 0x18_0000)),
            ("symbols", MemoryRegion::new(0x17_0000, 0x19_0000)),
        ];
        let err = slot()
            .create(0x19_0000, 0x400_0000, heap(), KernelConfig::DEFAULT, &reserved)
            .err();
        assert!(matches!(err, Some(MachineError::MemoryMap(MemoryMapError::Overlap { .. }))));
    }

    #[test]
    fn too_little_memory_fails_init() {
        let cfg = KernelConfig { brk_max: 0x10_0000, ..KernelConfig::DEFAULT };
        let m = slot().create(0x20_0000, 0x8_0000, heap(), cfg, &[]).unwrap();
        assert!(matches!(m.init(), Err(MachineError::Heap(HeapError::BrkOverflow { .. }))));
        assert!(!m.is_initialized());
    }

    #[test]
    fn map_conflict_leaves_heap_down() {
        let heap = heap();
        let cfg = KernelConfig { brk_max: 0x10_0000, ..KernelConfig::DEFAULT };
        // A firmware range sitting where the brk region would go.
        let reserved = [("firmware", MemoryRegion::new(0x28_0000, 0x29_0000))];
        let m = slot().create(0x20_0000, 0x400_0000, heap, cfg, &reserved).unwrap();

        for _ in 0..2 {
            assert!(matches!(
                m.init(),
                Err(MachineError::MemoryMap(MemoryMapError::Overlap { name: "heap brk", existing: "firmware" }))
            ));
            assert!(!heap.heap_ready());
            assert!(!m.is_initialized());
        }
        m.with_memory_map(|map| {
            assert_eq!(map.len(), 1);
            assert!(map.get("heap brk").is_none());
        });
    }
}
