/*!
    This module computes and uses the memory mapping binding named variables to the process data image (PDI).

    The PDI is a single contiguous byte buffer `[outputs | inputs]`: bytes `[0, output_size)`
    are sent to the slaves each cycle, bytes `[output_size, len)` are refreshed from them.
    Its layout is fixed when the master initializes and immutable for the session.

    ## Principle

    Each slave descriptor declares the byte ranges it owns in each half. Each process-image
    variable declares a bit offset relative to its half. A variable belongs to the slave
    whose bit range strictly contains its offset (half-open containment, no cumulative-drift
    arithmetic, no fuzzy matching); a variable contained by no slave is dropped, not an error.

    Each mapped variable carries three raw value cells used by the cyclic engine: the
    pending value written by the user, the shadow of what was last serialized, and the
    current value deserialized from the last successful cycle.
*/

use crate::{
    config::Network,
    data::{self, PackingResult, PduData, TypeId},
    error::{EthercatError, EthercatResult},
};
use std::collections::HashMap;

/// one named variable bound to a bit range of the process data image
#[derive(Clone, Debug)]
pub struct VariableMapping {
    pub name: String,
    /// offset of the first byte of the variable in the whole image
    pub pdi_byte_offset: usize,
    /// position inside the byte, present only for single-bit types
    pub bit_offset: Option<u8>,
    pub data_type: TypeId,
    /// true for variables of the inputs half
    pub is_input: bool,
    pub bit_size: u32,
    /// index of the owning slave in the network description
    pub slave_index: usize,

    /// next value to serialize, written by the user
    pending: u64,
    /// last serialized value
    shadow: u64,
    /// last deserialized value
    current: u64,
}

/// the variable→image binding table of one session
pub struct Mapping {
    output_size: usize,
    input_size: usize,
    /// mappings of the outputs half, in declaration order
    outputs: Vec<VariableMapping>,
    /// mappings of the inputs half, in declaration order
    inputs: Vec<VariableMapping>,
    /// name → (half, position in the matching sequence)
    index: HashMap<String, (bool, usize)>,
}

impl Mapping {
    /// compute the mapping table from a network description
    pub fn new(network: &Network) -> EthercatResult<Self> {
        let (output_size, input_size) = image_sizes(network);

        let mut mapping = Self {
            output_size,
            input_size,
            outputs: Vec::new(),
            inputs: Vec::new(),
            index: HashMap::new(),
        };

        if let Some(image) = &network.process_image {
            for variable in &image.outputs {
                mapping.insert(network, variable, false)?;
            }
            for variable in &image.inputs {
                mapping.insert(network, variable, true)?;
            }
        }
        Ok(mapping)
    }

    fn insert(&mut self, network: &Network, variable: &crate::config::ProcessVariable, is_input: bool) -> EthercatResult<()> {
        let bit = variable.bit_offset;
        let size = variable.size();

        // select the owning slave by strict half-open containment of the bit offset
        let owner = network.slaves.iter().enumerate().find(|(_, slave)| {
            let Some(process) = &slave.process_data else { return false };
            let (start, length) = if is_input {
                (process.input_byte_offset as u64 * 8, process.input_bit_length as u64)
            } else {
                (process.output_byte_offset as u64 * 8, process.output_bit_length as u64)
            };
            length != 0 && bit >= start && bit < start + length
        });
        let Some((slave_index, slave)) = owner else {
            log::debug!("variable {:?} is contained by no slave, dropped", variable.name);
            return Ok(());
        };

        // entries with explicit legacy offsets and process-image variables are two layout
        // sources that cannot be reconciled for one slave
        if slave
            .process_data
            .as_ref()
            .is_some_and(|process| process.entries.iter().any(|entry| entry.pdo_byte_offset.is_some()))
        {
            return Err(EthercatError::Master(
                "slave mixes explicit PDO offsets with process-image variables",
            ));
        }

        let half = usize::try_from(bit / 8).map_err(|_| EthercatError::Master("variable bit offset out of range"))?;
        let (pdi_byte_offset, half_end) = if is_input {
            (self.output_size + half, self.output_size + self.input_size)
        } else {
            (half, self.output_size)
        };
        let bit_offset = if variable.data_type.is_bit() {
            Some((bit % 8) as u8)
        } else {
            if bit % 8 != 0 {
                return Err(EthercatError::Master("multi-byte variable is not byte aligned"));
            }
            None
        };

        // the variable must lie entirely inside its half
        let end = pdi_byte_offset + (bit_offset.unwrap_or(0) as usize + size as usize + 7) / 8;
        if end > half_end {
            return Err(EthercatError::Master("variable overflows its half of the process image"));
        }

        let sequence = if is_input { &mut self.inputs } else { &mut self.outputs };
        self.index.insert(variable.name.clone(), (is_input, sequence.len()));
        sequence.push(VariableMapping {
            name: variable.name.clone(),
            pdi_byte_offset,
            bit_offset,
            data_type: variable.data_type,
            is_input,
            bit_size: size,
            slave_index,
            pending: 0,
            shadow: 0,
            current: 0,
        });
        Ok(())
    }

    /// size of the outputs half in bytes
    pub fn output_size(&self) -> usize {
        self.output_size
    }
    /// size of the inputs half in bytes
    pub fn input_size(&self) -> usize {
        self.input_size
    }
    /// size of the whole image in bytes
    pub fn image_size(&self) -> usize {
        self.output_size + self.input_size
    }

    /// the mapping of the given variable, if it survived matching
    pub fn lookup(&self, name: &str) -> Option<&VariableMapping> {
        let &(is_input, position) = self.index.get(name)?;
        Some(if is_input { &self.inputs[position] } else { &self.outputs[position] })
    }
    /// the output mappings, in declaration order
    pub fn outputs(&self) -> &[VariableMapping] {
        &self.outputs
    }
    /// the input mappings, in declaration order
    pub fn inputs(&self) -> &[VariableMapping] {
        &self.inputs
    }

    /// stage a new value for an output variable, serialized by the next cycle
    pub fn set<T: PduData>(&mut self, name: &str, value: T) -> EthercatResult<()> {
        let &(is_input, position) = self.index.get(name).ok_or(EthercatError::Master("unknown variable"))?;
        if is_input {
            return Err(EthercatError::Master("input variables cannot be written"));
        }
        let mapping = &mut self.outputs[position];
        if !compatible::<T>(mapping.data_type) {
            return Err(EthercatError::Master("value type does not match the variable's declared type"));
        }
        mapping.pending = data::value_bits(&value)?;
        Ok(())
    }

    /// the value of a variable: the snapshot of the last successful cycle for an input,
    /// the pending value for an output
    pub fn get<T: PduData>(&self, name: &str) -> EthercatResult<T> {
        let &(is_input, position) = self.index.get(name).ok_or(EthercatError::Master("unknown variable"))?;
        let mapping = if is_input { &self.inputs[position] } else { &self.outputs[position] };
        if !compatible::<T>(mapping.data_type) {
            return Err(EthercatError::Master("value type does not match the variable's declared type"));
        }
        Ok(data::value_from_bits(if is_input { mapping.current } else { mapping.pending })?)
    }

    /// serialize every output whose pending value differs from its last serialized value
    pub(crate) fn serialize_outputs(&mut self, image: &mut [u8]) -> PackingResult<()> {
        for mapping in &mut self.outputs {
            if mapping.pending != mapping.shadow {
                mapping.data_type.encode_bits(
                    mapping.pending,
                    &mut image[mapping.pdi_byte_offset..],
                    mapping.bit_offset.unwrap_or(0),
                )?;
                mapping.shadow = mapping.pending;
            }
        }
        Ok(())
    }

    /// refresh every input snapshot from the image, after a successful cycle
    pub(crate) fn deserialize_inputs(&mut self, image: &[u8]) -> PackingResult<()> {
        for mapping in &mut self.inputs {
            mapping.current = mapping
                .data_type
                .decode_bits(&image[mapping.pdi_byte_offset..], mapping.bit_offset.unwrap_or(0))?;
        }
        Ok(())
    }
}

/// true when `T` can read/write a variable declared with the given type
fn compatible<T: PduData>(declared: TypeId) -> bool {
    T::ID == declared
}

/// sizes of the two halves implied by the slave ranges of a description
fn image_sizes(network: &Network) -> (usize, usize) {
    let mut output_size = 0;
    let mut input_size = 0;
    for slave in &network.slaves {
        let Some(process) = &slave.process_data else { continue };
        if process.output_bit_length != 0 {
            output_size = output_size.max(process.output_byte_offset + (process.output_bit_length + 7) / 8);
        }
        if process.input_bit_length != 0 {
            input_size = input_size.max(process.input_byte_offset + (process.input_bit_length + 7) / 8);
        }
    }
    (output_size, input_size)
}

/**
    the process data image: one contiguous allocation, outputs then inputs.

    Byte getters/setters never suspend; the cyclic engine is the only writer of the inputs
    half, user code writes the outputs half between cycles.
*/
pub struct ProcessImage {
    buffer: Vec<u8>,
    output_size: usize,
}

impl ProcessImage {
    pub fn new(output_size: usize, input_size: usize) -> Self {
        Self { buffer: vec![0; output_size + input_size], output_size }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
    pub fn output_size(&self) -> usize {
        self.output_size
    }
    pub fn input_size(&self) -> usize {
        self.buffer.len() - self.output_size
    }

    /// the whole image
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }
    /// the whole image, writable. Offsets are not re-checked: bulk callers are on their own.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
    /// the outputs half
    pub fn outputs(&self) -> &[u8] {
        &self.buffer[..self.output_size]
    }
    pub fn outputs_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.output_size]
    }
    /// the inputs half
    pub fn inputs(&self) -> &[u8] {
        &self.buffer[self.output_size..]
    }
    pub fn inputs_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.output_size..]
    }
    /// both halves at once, for the exchange: outputs to transmit, inputs to refresh
    pub fn halves_mut(&mut self) -> (&[u8], &mut [u8]) {
        let (outputs, inputs) = self.buffer.split_at_mut(self.output_size);
        (outputs, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MailboxConfig, ProcessData, ProcessImageConfig, ProcessVariable, SlaveConfig};

    fn two_half_network() -> Network {
        // outputs half: 1 byte owned by slave 0. inputs half: bytes [1..5) of the image,
        // owned by slave 0 (2 bytes) then slave 1 (2 bytes).
        let mut network = Network::default();
        network.slaves.push(SlaveConfig {
            process_data: Some(ProcessData {
                output_byte_offset: 0,
                output_bit_length: 8,
                input_byte_offset: 0,
                input_bit_length: 16,
                entries: Vec::new(),
            }),
            mailbox: Some(MailboxConfig::default()),
            ..Default::default()
        });
        network.slaves.push(SlaveConfig {
            process_data: Some(ProcessData {
                output_byte_offset: 0,
                output_bit_length: 0,
                input_byte_offset: 2,
                input_bit_length: 16,
                entries: Vec::new(),
            }),
            ..Default::default()
        });
        network.process_image = Some(ProcessImageConfig {
            outputs: vec![ProcessVariable {
                name: "Out".into(),
                data_type: TypeId::U8,
                bit_offset: 0,
                bit_size: None,
            }],
            inputs: vec![
                ProcessVariable {
                    name: "In_U16".into(),
                    data_type: TypeId::U16,
                    bit_offset: 0,
                    bit_size: None,
                },
                ProcessVariable {
                    name: "In_Bool".into(),
                    data_type: TypeId::BOOL,
                    bit_offset: 24,
                    bit_size: None,
                },
            ],
        });
        network
    }

    #[test]
    fn explicit_range_matching() {
        let mapping = Mapping::new(&two_half_network()).unwrap();
        assert_eq!(mapping.output_size(), 1);
        assert_eq!(mapping.input_size(), 4);

        let out = mapping.lookup("Out").unwrap();
        assert_eq!((out.pdi_byte_offset, out.bit_offset, out.slave_index), (0, None, 0));
        let word = mapping.lookup("In_U16").unwrap();
        assert_eq!((word.pdi_byte_offset, word.slave_index, word.is_input), (1, 0, true));
        let bit = mapping.lookup("In_Bool").unwrap();
        assert_eq!((bit.pdi_byte_offset, bit.bit_offset, bit.slave_index), (4, Some(0), 1));
    }

    #[test]
    fn uncontained_variable_is_dropped() {
        let mut network = two_half_network();
        network.process_image.as_mut().unwrap().inputs.push(ProcessVariable {
            name: "Orphan".into(),
            data_type: TypeId::U8,
            bit_offset: 4000,
            bit_size: None,
        });
        let mapping = Mapping::new(&network).unwrap();
        assert!(mapping.lookup("Orphan").is_none());
        assert!(mapping.lookup("In_U16").is_some());
    }

    #[test]
    fn mixed_offset_styles_are_refused() {
        let mut network = two_half_network();
        network.slaves[0].process_data.as_mut().unwrap().entries.push(crate::config::PdoEntryConfig {
            name: "Legacy".into(),
            index: 0x7000,
            sub_index: 1,
            bit_length: 8,
            data_type: TypeId::U8,
            pdo_byte_offset: Some(0),
            pdi_byte_offset: 0,
        });
        assert!(Mapping::new(&network).is_err());
    }

    #[test]
    fn mappings_stay_inside_their_half() {
        let mapping = Mapping::new(&two_half_network()).unwrap();
        for variable in mapping.outputs().iter().chain(mapping.inputs()) {
            let end = variable.pdi_byte_offset
                + (variable.bit_offset.unwrap_or(0) as usize + variable.bit_size as usize + 7) / 8;
            assert!(end <= mapping.image_size());
            if variable.is_input {
                assert!(variable.pdi_byte_offset >= mapping.output_size());
            } else {
                assert!(end <= mapping.output_size());
            }
        }
    }

    #[test]
    fn bool_write_preserves_sibling_bits() {
        let mut network = two_half_network();
        network.process_image.as_mut().unwrap().outputs.push(ProcessVariable {
            name: "Flag".into(),
            data_type: TypeId::BOOL,
            bit_offset: 3,
            bit_size: None,
        });
        let mut mapping = Mapping::new(&network).unwrap();
        let mut image = vec![0u8; mapping.image_size()];
        image[0] = 0b1010_0101;

        mapping.set("Flag", true).unwrap();
        mapping.serialize_outputs(&mut image).unwrap();
        assert_eq!(image[0], 0b1010_1101);
    }

    #[test]
    fn input_snapshot_follows_the_image() {
        let mut mapping = Mapping::new(&two_half_network()).unwrap();
        let mut image = vec![0u8; mapping.image_size()];
        image[1] = 0x34;
        image[2] = 0x12;
        image[4] = 0x01;
        mapping.deserialize_inputs(&image).unwrap();
        assert_eq!(mapping.get::<u16>("In_U16").unwrap(), 0x1234);
        assert!(mapping.get::<bool>("In_Bool").unwrap());
    }
}
