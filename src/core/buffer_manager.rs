// This module implements the BufferManager, the registry of every memory buffer the compiled
// network needs. Buffers are identified by dense integer ids assigned strictly in call order,
// with id zero reserved for the command stream. DRAM buffers record only their size until
// allocate() is called exactly once; at that point each buffer type is laid out contiguously
// in id order and the payloads of constant buffers are concatenated into two regions, one
// read by the DMA engine (encoded weights) and one read by the control unit (weight metadata
// and the command stream itself). SRAM buffers carry their on-chip offset from registration.
// The ordered map keeps iteration, and therefore layout, reproducible across runs.

//! Registry and layout of DRAM and SRAM buffers.

use super::error::{CompileError, CompileResult};
use std::collections::BTreeMap;

/// Role of a buffer in the compiled network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Input,
    Output,
    ConstantDma,
    ConstantControlUnit,
    Intermediate,
}

/// Physical home of a buffer or tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum BufferLocation {
    #[default]
    None,
    Dram,
    Sram,
}

/// One registered buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerBufferInfo {
    pub buffer_type: BufferType,
    /// Byte offset within its region; meaningful for DRAM only after layout.
    pub offset: u32,
    pub size: u32,
    pub location: BufferLocation,
    /// Empty unless this buffer is constant.
    pub constant_data: Vec<u8>,
    /// Only relevant for input and output buffers.
    pub source_operation_id: Option<u32>,
    /// Only relevant for output buffers.
    pub source_operation_output_index: Option<u32>,
}

impl CompilerBufferInfo {
    fn new(buffer_type: BufferType, size: u32, location: BufferLocation) -> Self {
        Self {
            buffer_type,
            offset: 0,
            size,
            location,
            constant_data: Vec::new(),
            source_operation_id: None,
            source_operation_output_index: None,
        }
    }
}

/// Maintains and builds up the set of buffers required by the compiled network.
#[derive(Debug, Clone, Default)]
pub struct BufferManager {
    buffers: BTreeMap<u32, CompilerBufferInfo>,
    next_buffer_id: u32,
    allocated: bool,
    constant_dma_data: Vec<u8>,
    constant_control_unit_data: Vec<u8>,
}

impl BufferManager {
    /// Id reserved for the command stream buffer.
    pub const COMMAND_STREAM_ID: u32 = 0;

    pub fn new() -> Self {
        Self {
            next_buffer_id: 1,
            ..Default::default()
        }
    }

    fn insert(&mut self, info: CompilerBufferInfo) -> u32 {
        debug_assert!(!self.allocated, "buffers added after layout");
        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(id, info);
        id
    }

    /// Adds a DRAM buffer of the given type and size. Returns its id.
    pub fn add_dram(&mut self, buffer_type: BufferType, size: u32) -> u32 {
        self.insert(CompilerBufferInfo::new(buffer_type, size, BufferLocation::Dram))
    }

    /// Adds a constant DRAM buffer holding `constant_data`. Returns its id.
    pub fn add_dram_constant(&mut self, buffer_type: BufferType, constant_data: &[u8]) -> u32 {
        debug_assert!(matches!(
            buffer_type,
            BufferType::ConstantDma | BufferType::ConstantControlUnit
        ));
        let mut info = CompilerBufferInfo::new(buffer_type, constant_data.len() as u32, BufferLocation::Dram);
        info.constant_data = constant_data.to_vec();
        self.insert(info)
    }

    /// Adds a network input buffer fed by the given operation. Returns its id.
    pub fn add_dram_input(&mut self, size: u32, source_operation_id: u32) -> u32 {
        let mut info = CompilerBufferInfo::new(BufferType::Input, size, BufferLocation::Dram);
        info.source_operation_id = Some(source_operation_id);
        self.insert(info)
    }

    /// Adds an SRAM-resident buffer at a fixed on-chip offset. Returns its id.
    pub fn add_sram(&mut self, size: u32, offset: u32) -> u32 {
        let mut info = CompilerBufferInfo::new(BufferType::Intermediate, size, BufferLocation::Sram);
        info.offset = offset;
        self.insert(info)
    }

    /// Adds the serialized command stream. It always takes id zero.
    pub fn add_command_stream(&mut self, command_stream: &[u8]) {
        let mut info = CompilerBufferInfo::new(
            BufferType::ConstantControlUnit,
            command_stream.len() as u32,
            BufferLocation::Dram,
        );
        info.constant_data = command_stream.to_vec();
        self.buffers.insert(Self::COMMAND_STREAM_ID, info);
    }

    /// Changes the given buffer into a network output.
    pub fn change_to_output(
        &mut self,
        buffer_id: u32,
        source_operation_id: u32,
        source_operation_output_index: u32,
    ) -> CompileResult<()> {
        let info = self
            .buffers
            .get_mut(&buffer_id)
            .ok_or(CompileError::UnknownBuffer { id: buffer_id })?;
        info.buffer_type = BufferType::Output;
        info.source_operation_id = Some(source_operation_id);
        info.source_operation_output_index = Some(source_operation_output_index);
        Ok(())
    }

    /// SRAM offset of the given buffer, or zero for non-SRAM buffers.
    pub fn sram_offset(&self, buffer_id: u32) -> u32 {
        match self.buffers.get(&buffer_id) {
            Some(info) if info.location == BufferLocation::Sram => info.offset,
            _ => 0,
        }
    }

    /// Lays out every DRAM buffer so that buffers of each type are contiguous,
    /// and concatenates constant payloads into the DMA and control-unit regions.
    pub fn allocate(&mut self) -> CompileResult<()> {
        if self.allocated {
            return Err(CompileError::BuffersAlreadyAllocated);
        }

        let mut inputs_size = 0u32;
        let mut outputs_size = 0u32;
        let mut intermediates_size = 0u32;

        for info in self.buffers.values_mut() {
            if info.location != BufferLocation::Dram {
                continue;
            }
            match info.buffer_type {
                BufferType::Input => {
                    info.offset = inputs_size;
                    inputs_size += info.size;
                }
                BufferType::Output => {
                    info.offset = outputs_size;
                    outputs_size += info.size;
                }
                BufferType::Intermediate => {
                    info.offset = intermediates_size;
                    intermediates_size += info.size;
                }
                BufferType::ConstantDma => {
                    info.offset = self.constant_dma_data.len() as u32;
                    self.constant_dma_data.extend_from_slice(&info.constant_data);
                }
                BufferType::ConstantControlUnit => {
                    info.offset = self.constant_control_unit_data.len() as u32;
                    self.constant_control_unit_data.extend_from_slice(&info.constant_data);
                }
            }
        }

        self.allocated = true;
        log::debug!(
            "buffers laid out: inputs={} outputs={} intermediates={} dma={} control_unit={}",
            inputs_size,
            outputs_size,
            intermediates_size,
            self.constant_dma_data.len(),
            self.constant_control_unit_data.len()
        );
        Ok(())
    }

    /// All buffers, by id. Valid only after [`allocate`](Self::allocate).
    pub fn buffers(&self) -> CompileResult<&BTreeMap<u32, CompilerBufferInfo>> {
        self.ensure_allocated()?;
        Ok(&self.buffers)
    }

    /// Concatenated constant DMA data. Valid only after layout.
    pub fn constant_dma_data(&self) -> CompileResult<&[u8]> {
        self.ensure_allocated()?;
        Ok(&self.constant_dma_data)
    }

    /// Concatenated constant control-unit data. Valid only after layout.
    pub fn constant_control_unit_data(&self) -> CompileResult<&[u8]> {
        self.ensure_allocated()?;
        Ok(&self.constant_control_unit_data)
    }

    /// Look up a buffer before or after layout.
    pub fn get(&self, buffer_id: u32) -> Option<&CompilerBufferInfo> {
        self.buffers.get(&buffer_id)
    }

    /// Number of registered buffers, including the command stream if added.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn ensure_allocated(&self) -> CompileResult<()> {
        if self.allocated {
            Ok(())
        } else {
            Err(CompileError::BuffersNotAllocated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense_in_call_order() {
        let mut buffers = BufferManager::new();
        assert_eq!(buffers.add_dram_input(64, 7), 1);
        assert_eq!(buffers.add_dram(BufferType::Intermediate, 32), 2);
        assert_eq!(buffers.add_sram(16, 0x400), 3);
        assert_eq!(buffers.add_dram_constant(BufferType::ConstantDma, &[1, 2, 3]), 4);
    }

    #[test]
    fn test_sram_offset_only_for_sram_buffers() {
        let mut buffers = BufferManager::new();
        let dram = buffers.add_dram(BufferType::Intermediate, 32);
        let sram = buffers.add_sram(16, 0x400);
        assert_eq!(buffers.sram_offset(dram), 0);
        assert_eq!(buffers.sram_offset(sram), 0x400);
        assert_eq!(buffers.sram_offset(99), 0);
    }

    #[test]
    fn test_layout_is_contiguous_per_type() {
        let mut buffers = BufferManager::new();
        let in0 = buffers.add_dram_input(10, 0);
        let mid0 = buffers.add_dram(BufferType::Intermediate, 100);
        let in1 = buffers.add_dram_input(20, 1);
        let w0 = buffers.add_dram_constant(BufferType::ConstantDma, &[1, 2, 3]);
        let m0 = buffers.add_dram_constant(BufferType::ConstantControlUnit, &[9]);
        let mid1 = buffers.add_dram(BufferType::Intermediate, 50);
        let w1 = buffers.add_dram_constant(BufferType::ConstantDma, &[4, 5]);
        buffers.add_command_stream(&[0xAA, 0xBB]);
        buffers.allocate().unwrap();

        let table = buffers.buffers().unwrap();
        assert_eq!(table[&in0].offset, 0);
        assert_eq!(table[&in1].offset, 10);
        assert_eq!(table[&mid0].offset, 0);
        assert_eq!(table[&mid1].offset, 100);
        assert_eq!(table[&w0].offset, 0);
        assert_eq!(table[&w1].offset, 3);
        // The command stream (id 0) is laid out first in the control-unit region.
        assert_eq!(table[&BufferManager::COMMAND_STREAM_ID].offset, 0);
        assert_eq!(table[&m0].offset, 2);

        assert_eq!(buffers.constant_dma_data().unwrap(), &[1, 2, 3, 4, 5]);
        assert_eq!(buffers.constant_control_unit_data().unwrap(), &[0xAA, 0xBB, 9]);
    }

    #[test]
    fn test_accessors_require_layout() {
        let mut buffers = BufferManager::new();
        buffers.add_dram(BufferType::Intermediate, 8);
        assert!(matches!(buffers.buffers(), Err(CompileError::BuffersNotAllocated)));
        assert!(buffers.constant_dma_data().is_err());
        buffers.allocate().unwrap();
        assert!(buffers.buffers().is_ok());
        assert!(matches!(buffers.allocate(), Err(CompileError::BuffersAlreadyAllocated)));
    }

    #[test]
    fn test_change_to_output() {
        let mut buffers = BufferManager::new();
        let id = buffers.add_dram(BufferType::Intermediate, 8);
        buffers.change_to_output(id, 12, 1).unwrap();
        let info = buffers.get(id).unwrap();
        assert_eq!(info.buffer_type, BufferType::Output);
        assert_eq!(info.source_operation_id, Some(12));
        assert_eq!(info.source_operation_output_index, Some(1));
        assert!(buffers.change_to_output(42, 0, 0).is_err());
    }
}
