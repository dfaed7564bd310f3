//! Splitting a DIMSE message into P-DATA-TF PDUs and reassembling PDUs
//! back into a message.

use std::collections::BTreeMap;

use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};

use super::{CommandDataSetType, CommandField, CommandSet};

/// A fully reassembled (or about-to-be-fragmented) DIMSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command_field: CommandField,
    pub command: CommandSet,
    /// The dataset stream, still encoded under the presentation
    /// context's negotiated transfer syntax. `None` when
    /// `CommandDataSetType::Absent`.
    pub dataset: Option<Vec<u8>>,
}

/// Split `bytes` into fragments of at most `max_payload` bytes, flagging
/// the last fragment with `is_last`. An empty input yields exactly one
/// empty fragment, preserving the dataset-present/absent signal on the
/// wire (PS3.8 requires at least one PDV per stream).
fn chunk(bytes: &[u8], max_payload: usize) -> Vec<(&[u8], bool)> {
    if bytes.is_empty() {
        return vec![(bytes, true)];
    }
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + max_payload).min(bytes.len());
        chunks.push((&bytes[offset..end], end == bytes.len()));
        offset = end;
    }
    chunks
}

/// Fragment `message` into one P-DATA-TF PDU per PDV, addressed to
/// `presentation_context_id`, bounded by `max_pdu_length`.
pub fn encode_message(
    presentation_context_id: u8,
    message: &Message,
    max_pdu_length: u32,
) -> super::Result<Vec<Pdu>> {
    let dataset_type = if message.dataset.is_some() {
        CommandDataSetType::Present
    } else {
        CommandDataSetType::Absent
    };
    let command_bytes = message.command.encode(message.command_field, dataset_type)?;

    // PDU header (6) + PDV length prefix (4) + context id/control (2).
    let max_payload = max_pdu_length.saturating_sub(12).max(1) as usize;

    let mut pdus = Vec::new();
    let command_chunks = chunk(&command_bytes, max_payload);
    let has_dataset = message.dataset.is_some();
    let last_command_index = command_chunks.len() - 1;
    for (i, (data, is_last_chunk)) in command_chunks.into_iter().enumerate() {
        let is_last = is_last_chunk && i == last_command_index && !has_dataset;
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last,
                data: data.to_vec(),
            }],
        });
    }

    if let Some(dataset_bytes) = &message.dataset {
        for (data, is_last) in chunk(dataset_bytes, max_payload) {
            pdus.push(Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id,
                    value_type: PDataValueType::Data,
                    is_last,
                    data: data.to_vec(),
                }],
            });
        }
    }

    Ok(pdus)
}

#[derive(Debug, Default)]
struct ContextBuffers {
    command: Vec<u8>,
    command_done: bool,
    dataset: Vec<u8>,
    dataset_done: bool,
}

/// Reassembles DIMSE messages out of interleaved P-DATA-TF fragments,
/// keyed by presentation context ID. One reassembler serves an entire
/// association; each context's buffers are independent, so fragments
/// from different contexts may freely interleave.
#[derive(Debug, Default)]
pub struct MessageReassembler {
    contexts: BTreeMap<u8, ContextBuffers>,
}

impl MessageReassembler {
    pub fn new() -> Self {
        MessageReassembler::default()
    }

    /// Feed one PDV into the reassembler. Returns the completed message
    /// (and its presentation context ID) once its stream(s) are whole;
    /// otherwise `None`.
    pub fn add_pdv(
        &mut self,
        pdv: &PDataValue,
    ) -> super::Result<Option<(u8, Message)>> {
        let buffers = self
            .contexts
            .entry(pdv.presentation_context_id)
            .or_default();

        match pdv.value_type {
            PDataValueType::Command => {
                buffers.command.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    buffers.command_done = true;
                }
            }
            PDataValueType::Data => {
                buffers.dataset.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    buffers.dataset_done = true;
                }
            }
        }

        if !buffers.command_done {
            return Ok(None);
        }

        let (command_field, dataset_type, command) = CommandSet::decode(&buffers.command)?;
        let ready = match dataset_type {
            CommandDataSetType::Absent => true,
            CommandDataSetType::Present => buffers.dataset_done,
        };
        if !ready {
            return Ok(None);
        }

        let dataset = match dataset_type {
            CommandDataSetType::Absent => None,
            CommandDataSetType::Present => Some(std::mem::take(&mut buffers.dataset)),
        };
        let pc_id = pdv.presentation_context_id;
        self.contexts.remove(&pc_id);

        Ok(Some((
            pc_id,
            Message {
                command_field,
                command,
                dataset,
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_message(message_id: u16) -> Message {
        Message {
            command_field: CommandField::C_ECHO_RQ,
            command: CommandSet {
                message_id: Some(message_id),
                affected_sop_class_uid: Some("1.2.840.10008.1.1".to_owned()),
                ..Default::default()
            },
            dataset: None,
        }
    }

    #[test]
    fn round_trips_a_small_message_without_dataset() {
        let message = echo_message(1);
        let pdus = encode_message(1, &message, 16_384).unwrap();
        assert_eq!(pdus.len(), 1);

        let mut reassembler = MessageReassembler::new();
        let mut result = None;
        for pdu in &pdus {
            if let Pdu::PData { data } = pdu {
                for pdv in data {
                    if let Some(m) = reassembler.add_pdv(pdv).unwrap() {
                        result = Some(m);
                    }
                }
            }
        }
        let (pc_id, message) = result.expect("message should be complete");
        assert_eq!(pc_id, 1);
        assert_eq!(message.command_field, CommandField::C_ECHO_RQ);
        assert_eq!(message.command.message_id, Some(1));
        assert!(message.dataset.is_none());
    }

    #[test]
    fn fragments_a_large_dataset_into_many_pdus() {
        let dataset = vec![0xABu8; 50_000];
        let message = Message {
            command_field: CommandField::C_STORE_RQ,
            command: CommandSet {
                message_id: Some(2),
                affected_sop_class_uid: Some("1.2.840.10008.5.1.4.1.1.7".to_owned()),
                affected_sop_instance_uid: Some("1.2.3.4.5".to_owned()),
                ..Default::default()
            },
            dataset: Some(dataset.clone()),
        };

        let pdus = encode_message(1, &message, 4096).unwrap();
        let dataset_pdus = pdus
            .iter()
            .filter(|pdu| {
                matches!(pdu, Pdu::PData { data } if data[0].value_type == PDataValueType::Data)
            })
            .count();
        assert!(dataset_pdus >= 14, "expected at least 14 dataset PDUs, got {}", dataset_pdus);

        let mut reassembler = MessageReassembler::new();
        let mut result = None;
        for pdu in &pdus {
            if let Pdu::PData { data } = pdu {
                for pdv in data {
                    if let Some(m) = reassembler.add_pdv(pdv).unwrap() {
                        result = Some(m);
                    }
                }
            }
        }
        let (_, reassembled) = result.expect("message should be complete");
        assert_eq!(reassembled.dataset.as_deref(), Some(dataset.as_slice()));
    }

    #[test]
    fn interleaved_contexts_do_not_corrupt_each_other() {
        let message_a = echo_message(1);
        let message_b = echo_message(2);
        let pdus_a = encode_message(1, &message_a, 16_384).unwrap();
        let pdus_b = encode_message(3, &message_b, 16_384).unwrap();

        let mut reassembler = MessageReassembler::new();
        let mut completed = Vec::new();
        for (pdu_a, pdu_b) in pdus_a.iter().zip(pdus_b.iter()) {
            for pdu in [pdu_a, pdu_b] {
                if let Pdu::PData { data } = pdu {
                    for pdv in data {
                        if let Some(m) = reassembler.add_pdv(pdv).unwrap() {
                            completed.push(m);
                        }
                    }
                }
            }
        }

        assert_eq!(completed.len(), 2);
        let ids: Vec<_> = completed.iter().map(|(pc, _)| *pc).collect();
        assert!(ids.contains(&1));
        assert!(ids.contains(&3));
    }
}
