/// Register bank emulating the memory of one field node
///
/// Four fixed-capacity address spaces (coils, discrete inputs, holding
/// registers, input registers) behind a single mutex. Bulk operations are
/// atomic with respect to each other. Nothing here ever fails: reads past the
/// end return zero and writes past the end are dropped.

use std::sync::{Mutex, MutexGuard};

/// Smallest capacity any address space may have
pub const MIN_CAPACITY: usize = 256;

/// Size of each address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankCapacity {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
}

impl Default for BankCapacity {
    fn default() -> Self {
        Self {
            coils: 256,
            discrete_inputs: 256,
            holding_registers: 512,
            input_registers: 512,
        }
    }
}

impl BankCapacity {
    /// Register spaces large enough to cover the drive's 0x1000 status block
    pub fn field_node() -> Self {
        Self {
            holding_registers: 0x2000,
            input_registers: 0x2000,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct Tables {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

fn read_range<T: Copy + Default>(table: &[T], address: u16, quantity: u16) -> Vec<T> {
    (0..quantity as usize)
        .map(|i| table.get(address as usize + i).copied().unwrap_or_default())
        .collect()
}

fn write_range<T: Copy>(table: &mut [T], address: u16, values: &[T]) {
    let start = address as usize;
    if start >= table.len() {
        return;
    }
    let end = (start + values.len()).min(table.len());
    table[start..end].copy_from_slice(&values[..end - start]);
}

/// Memory of one field node
#[derive(Debug)]
pub struct ModbusRegisterBank {
    capacity: BankCapacity,
    tables: Mutex<Tables>,
}

impl ModbusRegisterBank {
    /// Create a bank with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(BankCapacity::default())
    }

    /// Create a bank; every space is raised to at least [`MIN_CAPACITY`]
    pub fn with_capacity(capacity: BankCapacity) -> Self {
        let capacity = BankCapacity {
            coils: capacity.coils.max(MIN_CAPACITY),
            discrete_inputs: capacity.discrete_inputs.max(MIN_CAPACITY),
            holding_registers: capacity.holding_registers.max(MIN_CAPACITY),
            input_registers: capacity.input_registers.max(MIN_CAPACITY),
        };
        Self {
            capacity,
            tables: Mutex::new(Tables {
                coils: vec![false; capacity.coils],
                discrete_inputs: vec![false; capacity.discrete_inputs],
                holding_registers: vec![0; capacity.holding_registers],
                input_registers: vec![0; capacity.input_registers],
            }),
        }
    }

    pub fn capacity(&self) -> BankCapacity {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn read_coils(&self, address: u16, quantity: u16) -> Vec<bool> {
        read_range(&self.lock().coils, address, quantity)
    }

    pub fn write_coils(&self, address: u16, values: &[bool]) {
        write_range(&mut self.lock().coils, address, values);
    }

    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Vec<bool> {
        read_range(&self.lock().discrete_inputs, address, quantity)
    }

    /// Set discrete inputs (for simulation/testing)
    pub fn write_discrete_inputs(&self, address: u16, values: &[bool]) {
        write_range(&mut self.lock().discrete_inputs, address, values);
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> Vec<u16> {
        read_range(&self.lock().holding_registers, address, quantity)
    }

    pub fn read_holding_register(&self, address: u16) -> u16 {
        self.read_holding_registers(address, 1)[0]
    }

    /// Write multiple registers (function codes 0x06 and 0x10)
    pub fn write_holding_registers(&self, address: u16, values: &[u16]) {
        write_range(&mut self.lock().holding_registers, address, values);
    }

    pub fn write_holding_register(&self, address: u16, value: u16) {
        self.write_holding_registers(address, &[value]);
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> Vec<u16> {
        read_range(&self.lock().input_registers, address, quantity)
    }

    pub fn read_input_register(&self, address: u16) -> u16 {
        self.read_input_registers(address, 1)[0]
    }

    /// Set input registers (the serving node's side of a read-only space)
    pub fn write_input_registers(&self, address: u16, values: &[u16]) {
        write_range(&mut self.lock().input_registers, address, values);
    }

    pub fn write_input_register(&self, address: u16, value: u16) {
        self.write_input_registers(address, &[value]);
    }

    /// Read a holding block and clear one register of it under the same lock
    ///
    /// Used to consume a command slot so a concurrent writer can never see
    /// its new command wiped by a late clear.
    pub fn take_holding_block(&self, address: u16, quantity: u16, clear: u16) -> Vec<u16> {
        let mut tables = self.lock();
        let block = read_range(&tables.holding_registers, address, quantity);
        write_range(&mut tables.holding_registers, clear, &[0]);
        block
    }

    /// Zero every space
    pub fn reset(&self) {
        let mut tables = self.lock();
        tables.coils.iter_mut().for_each(|c| *c = false);
        tables.discrete_inputs.iter_mut().for_each(|c| *c = false);
        tables.holding_registers.iter_mut().for_each(|r| *r = 0);
        tables.input_registers.iter_mut().for_each(|r| *r = 0);
    }

    /// Count of non-zero cells per space
    pub fn get_stats(&self) -> RegisterBankStats {
        let tables = self.lock();
        RegisterBankStats {
            coils_set: tables.coils.iter().filter(|c| **c).count(),
            discrete_inputs_set: tables.discrete_inputs.iter().filter(|c| **c).count(),
            holding_registers_set: tables.holding_registers.iter().filter(|r| **r != 0).count(),
            input_registers_set: tables.input_registers.iter().filter(|r| **r != 0).count(),
        }
    }
}

impl Default for ModbusRegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Register bank statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub coils_set: usize,
    pub discrete_inputs_set: usize,
    pub holding_registers_set: usize,
    pub input_registers_set: usize,
}
