use crate::virtual_machine::errors::VMError;
use std::sync::{Arc, Mutex, PoisonError};

/// Device index that addresses main memory in load/store/copy instructions
/// and in `MEMSIZE`. `CALL` still reaches the peripheral attached to slot 0.
pub const MAIN_MEMORY_DEVICE: u32 = 0;

/// Slot reserved for the BIOS device.
pub const BIOS_SLOT: u32 = 255;

/// A host device reachable from programs.
///
/// Programs read and write the device's memory through the load/store
/// instructions with a non-zero device operand, and trigger its behavior with
/// `CALL arg, slot` for any slot, 0 included.
pub trait Peripheral: Send {
    /// Device memory as seen by load instructions.
    fn memory(&self) -> &[u8];
    /// Device memory as seen by store instructions.
    fn memory_mut(&mut self) -> &mut [u8];
    /// Handles `CALL` with the value of its register operand.
    ///
    /// Returning [`VMError::Fault`] raises that interrupt in the program; any
    /// other error stops the VM.
    fn call(&mut self, arg: u32) -> Result<(), VMError>;
}

/// Peripheral slots `0..=254` plus the BIOS slot.
pub struct PeripheralTable {
    slots: Vec<Option<Box<dyn Peripheral>>>,
}

impl Default for PeripheralTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeripheralTable {
    pub fn new() -> Self {
        Self {
            slots: (0..=BIOS_SLOT).map(|_| None).collect(),
        }
    }

    /// Installs `device` in `slot`, returning the device it replaced.
    pub fn attach(
        &mut self,
        slot: u32,
        device: Box<dyn Peripheral>,
    ) -> Result<Option<Box<dyn Peripheral>>, VMError> {
        if slot > BIOS_SLOT {
            return Err(VMError::UnattachedDevice { slot });
        }
        Ok(self.slots[slot as usize].replace(device))
    }

    pub fn detach(&mut self, slot: u32) -> Option<Box<dyn Peripheral>> {
        self.slots.get_mut(slot as usize).and_then(Option::take)
    }

    pub fn get(&self, slot: u32) -> Result<&dyn Peripheral, VMError> {
        match self.slots.get(slot as usize) {
            Some(Some(device)) => Ok(device.as_ref()),
            _ => Err(VMError::UnattachedDevice { slot }),
        }
    }

    pub fn get_mut(&mut self, slot: u32) -> Result<&mut (dyn Peripheral + 'static), VMError> {
        match self.slots.get_mut(slot as usize) {
            Some(Some(device)) => Ok(device.as_mut()),
            _ => Err(VMError::UnattachedDevice { slot }),
        }
    }
}

/// Shared record of the arguments a [`MemoryDevice`] was called with.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<u32>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<u32> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, arg: u32) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(arg);
    }
}

/// Plain memory-backed peripheral that records its calls.
pub struct MemoryDevice {
    memory: Vec<u8>,
    log: CallLog,
}

impl MemoryDevice {
    pub fn new(size: usize) -> Self {
        Self {
            memory: vec![0; size],
            log: CallLog::default(),
        }
    }

    /// Handle for inspecting calls after the device has been attached.
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }
}

impl Peripheral for MemoryDevice {
    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn call(&mut self, arg: u32) -> Result<(), VMError> {
        self.log.record(arg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slots_are_unattached() {
        let table = PeripheralTable::new();
        assert!(matches!(
            table.get(3),
            Err(VMError::UnattachedDevice { slot: 3 })
        ));
        assert!(table.get(BIOS_SLOT).is_err());
        assert!(table.get(1000).is_err());
    }

    #[test]
    fn slot_zero_holds_a_device() {
        let mut table = PeripheralTable::new();
        assert!(table.get(0).is_err());
        let dev = MemoryDevice::new(4);
        let log = dev.call_log();
        table.attach(0, Box::new(dev)).unwrap();
        table.get_mut(0).unwrap().call(7).unwrap();
        assert_eq!(log.calls(), vec![7]);
        assert!(table.attach(BIOS_SLOT + 1, Box::new(MemoryDevice::new(4))).is_err());
    }

    #[test]
    fn attach_replaces_and_records_calls() {
        let mut table = PeripheralTable::new();
        let dev = MemoryDevice::new(16);
        let log = dev.call_log();
        assert!(table.attach(2, Box::new(dev)).unwrap().is_none());
        table.get_mut(2).unwrap().call(42).unwrap();
        assert_eq!(log.calls(), vec![42]);
        assert_eq!(table.get(2).unwrap().memory().len(), 16);

        assert!(table.attach(2, Box::new(MemoryDevice::new(8))).unwrap().is_some());
        assert!(table.detach(2).is_some());
        assert!(table.get(2).is_err());
    }

    #[test]
    fn bios_slot_is_addressable() {
        let mut table = PeripheralTable::new();
        table.attach(BIOS_SLOT, Box::new(MemoryDevice::new(32))).unwrap();
        assert_eq!(table.get(BIOS_SLOT).unwrap().memory().len(), 32);
    }
}
