//! Turns a harvested output buffer into reports.
//!
//! Decoding is a pure function of the buffer words and the shader records, so a buffer can
//! be decoded again with identical results. It must only run once the submission's
//! completion token has been observed.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use gpuav_spirv::op;
use tracing::{debug, warn};

use crate::diagnostics::{rules, ObjectHandle, Severity, ViolationReport};
use crate::instrument::InstrumentedShaderRecord;
use crate::printf;
use crate::protocol::{
    BufferCheck, DiagnosticRecord, Payload, CAPACITY_WORD, COUNTER_WORD, HEADER_WORDS,
    RECORD_WORDS,
};

/// Instrumented shaders by engine shader id.
pub type ShaderLookup = HashMap<u32, Arc<InstrumentedShaderRecord>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub records: Vec<DiagnosticRecord>,
    /// Violation and debug-printf reports followed by meta-diagnostics.
    pub reports: Vec<ViolationReport>,
    /// Records the shaders attempted but found no slot for.
    pub dropped: u32,
    pub malformed: u32,
}

pub fn decode_output_buffer(
    words: &[u32],
    object: ObjectHandle,
    shaders: &ShaderLookup,
) -> DecodeOutcome {
    let mut outcome = DecodeOutcome::default();
    if words.len() < HEADER_WORDS {
        outcome.malformed += 1;
        outcome.reports.push(ViolationReport::new(
            Severity::Error,
            rules::MALFORMED_RECORD,
            object,
            format!(
                "diagnostic buffer holds {} words, fewer than its {HEADER_WORDS} word header",
                words.len()
            ),
        ));
        return outcome;
    }

    let counter = words[COUNTER_WORD];
    let declared = words[CAPACITY_WORD];
    let available = ((words.len() - HEADER_WORDS) / RECORD_WORDS) as u32;
    let capacity = if declared > available {
        outcome.malformed += 1;
        outcome.reports.push(ViolationReport::new(
            Severity::Error,
            rules::MALFORMED_RECORD,
            object,
            format!(
                "diagnostic buffer declares {declared} record slots but only holds {available}"
            ),
        ));
        available
    } else {
        declared
    };

    let mut meta = Vec::new();
    for slot in 0..counter.min(capacity) {
        let start = HEADER_WORDS + slot as usize * RECORD_WORDS;
        let Some(raw) = words
            .get(start..start + RECORD_WORDS)
            .and_then(|s| <&[u32; RECORD_WORDS]>::try_from(s).ok())
        else {
            break;
        };
        // Claimed but never written (or not yet visible): nothing to say about it.
        if raw[0] == 0 {
            continue;
        }
        let described = DiagnosticRecord::decode(raw)
            .map_err(|err| err.to_string())
            .and_then(|record| {
                let report = describe(&record, object, shaders.get(&record.shader_id))?;
                Ok((record, report))
            });
        match described {
            Ok((record, report)) => {
                outcome.reports.push(report);
                outcome.records.push(record);
            }
            Err(err) => {
                warn!(slot, error = %err, "malformed diagnostic record");
                outcome.malformed += 1;
                meta.push(ViolationReport::new(
                    Severity::Error,
                    rules::MALFORMED_RECORD,
                    object,
                    format!("record slot {slot}: {err}"),
                ));
            }
        }
    }

    if counter > declared {
        outcome.dropped = counter - declared;
        meta.push(ViolationReport::new(
            Severity::Warning,
            rules::RESULTS_TRUNCATED,
            object,
            format!(
                "{} diagnostic records were dropped: the output buffer holds {declared}, \
                 {counter} were produced",
                outcome.dropped
            ),
        ));
    }
    debug!(
        records = outcome.records.len(),
        dropped = outcome.dropped,
        malformed = outcome.malformed,
        "decoded diagnostic buffer"
    );
    outcome.reports.extend(meta);
    outcome
}

/// Formats a decoded record. Fails when the record cannot be interpreted against its
/// shader, which makes it malformed.
fn describe(
    record: &DiagnosticRecord,
    object: ObjectHandle,
    shader: Option<&Arc<InstrumentedShaderRecord>>,
) -> Result<ViolationReport, String> {
    let kind = record.kind();
    let mut message = match &record.payload {
        Payload::DebugPrintf {
            format_index,
            arg_words,
            args,
        } => {
            let Some(format) = shader.and_then(|s| s.printf_format(*format_index)) else {
                return Err(format!(
                    "debug printf record names format {format_index}, unknown for shader id {}",
                    record.shader_id
                ));
            };
            let formatted = printf::format(format, args);
            let mut text = formatted.text;
            if formatted.truncated || *arg_words as usize > args.len() {
                text.push_str(" [arguments truncated]");
            }
            text
        }
        payload => violation_text(payload),
    };

    let name = match shader {
        Some(s) => s.display_name(),
        None => format!("unknown shader id {}", record.shader_id),
    };
    let _ = write!(message, " (in {name}");
    match shader.and_then(|s| s.site(record.location)) {
        Some(site) => {
            let _ = write!(
                message,
                ", {} at word {}",
                op::name(site.opcode),
                record.location
            );
            if let Some(source) = &site.source {
                let _ = write!(message, ", {source}");
            }
        }
        None => {
            let _ = write!(message, ", word {}", record.location);
        }
    }
    if let Some(stage) = stage_text(record) {
        let _ = write!(message, ", {stage}");
    }
    message.push(')');
    Ok(ViolationReport::new(kind.severity(), kind.rule_id(), object, message))
}

fn violation_text(payload: &Payload) -> String {
    match *payload {
        Payload::BufferOob {
            set,
            binding,
            element,
            value,
            limit,
            check: BufferCheck::BoundRange,
        } => format!(
            "access ending at byte {value} is outside the {limit} bytes bound to \
             set {set}, binding {binding}, element {element}"
        ),
        Payload::BufferOob {
            set,
            binding,
            element,
            value,
            limit,
            check: BufferCheck::ArrayIndex,
        } => format!(
            "index {value} is out of bounds for an array of length {limit} in \
             set {set}, binding {binding}, element {element}"
        ),
        Payload::DescriptorIndexOob {
            set,
            binding,
            index,
            count,
        } => format!(
            "descriptor index {index} is out of bounds for set {set}, binding {binding} \
             with {count} descriptors"
        ),
        Payload::DescriptorUninitialized {
            set,
            binding,
            index,
        } => format!(
            "descriptor set {set}, binding {binding}, element {index} was never written"
        ),
        Payload::AddressOob { address, size } => format!(
            "{size} byte access at device address {address:#x} is outside every live buffer"
        ),
        Payload::PushConstantOob { end, range_end } => format!(
            "push constant access ending at byte {end} exceeds the {range_end} byte range"
        ),
        Payload::ImageOob {
            set,
            binding,
            coord,
            extent,
        } => format!(
            "coordinate ({}, {}, {}) is outside the ({}, {}, {}) extent of the image at \
             set {set}, binding {binding}",
            coord[0], coord[1], coord[2], extent[0], extent[1], extent[2]
        ),
        Payload::DebugPrintf { .. } => String::new(),
    }
}

fn stage_text(record: &DiagnosticRecord) -> Option<String> {
    use op::execution_model as model;

    let [a, b, c] = record.stage;
    match record.execution_model {
        model::GL_COMPUTE => Some(format!("global invocation ({a}, {b}, {c})")),
        model::VERTEX => Some(format!("vertex {a}, instance {b}")),
        model::FRAGMENT => Some(format!("fragment ({a}, {b})")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckSet;
    use crate::instrument::{Guard, InstrumentOptions, Outcome, SiteInfo, SkipReason};
    use crate::layout::LayoutFingerprint;
    use crate::protocol::{output_buffer_words, InvocationState, RecordWriter};
    use crate::shader::ShaderImage;

    fn shader(id: u32) -> Arc<InstrumentedShaderRecord> {
        let image = ShaderImage::new(&[], Some("blur.comp".into()));
        let mut record = InstrumentedShaderRecord::skipped(
            &image,
            SkipReason::Filtered,
            LayoutFingerprint::NONE,
            &InstrumentOptions {
                checks: CheckSet::all(),
                safe_mode: true,
                max_shader_words: 100,
                shader_id: id,
            },
        );
        record.outcome = Outcome::Instrumented;
        record.sites.insert(
            40,
            SiteInfo {
                opcode: op::LOAD,
                checks: CheckSet::BUFFER_OOB,
                source: None,
                guard: Guard::Guarded,
            },
        );
        record.printf_formats.push("x=%u y=%u".into());
        Arc::new(record)
    }

    fn oob(element: u32) -> DiagnosticRecord {
        DiagnosticRecord {
            shader_id: 1,
            location: 40,
            execution_model: op::execution_model::GL_COMPUTE,
            stage: [element, 0, 0],
            payload: Payload::BufferOob {
                set: 0,
                binding: 0,
                element: 0,
                value: 4 * element + 4,
                limit: 64,
                check: BufferCheck::BoundRange,
            },
        }
    }

    fn buffer(capacity: u32, records: &[DiagnosticRecord]) -> Vec<u32> {
        let mut words = vec![0; output_buffer_words(capacity)];
        let mut writer = RecordWriter::init(&mut words, capacity);
        for r in records {
            writer.write(&mut InvocationState::default(), r);
        }
        words
    }

    fn lookup() -> ShaderLookup {
        HashMap::from([(1, shader(1))])
    }

    #[test]
    fn violation_message_names_shader_site_and_invocation() {
        let words = buffer(4, &[oob(20)]);
        let out = decode_output_buffer(&words, ObjectHandle::CommandBuffer(9), &lookup());
        assert_eq!(out.records.len(), 1);
        let report = &out.reports[0];
        assert_eq!(report.rule_id, rules::BUFFER_OOB);
        assert_eq!(report.severity, Severity::Error);
        assert!(report.message.contains("byte 84"), "{}", report.message);
        assert!(report.message.contains("blur.comp"));
        assert!(report.message.contains("OpLoad at word 40"));
        assert!(report.message.contains("global invocation (20, 0, 0)"));
    }

    #[test]
    fn exact_capacity_has_no_truncation_notice() {
        let records: Vec<_> = (16..20).map(oob).collect();
        let out = decode_output_buffer(&buffer(4, &records), ObjectHandle::None, &lookup());
        assert_eq!(out.records.len(), 4);
        assert_eq!(out.dropped, 0);
        assert!(out.reports.iter().all(|r| r.rule_id != rules::RESULTS_TRUNCATED));
    }

    #[test]
    fn one_over_capacity_reports_truncation_once() {
        let records: Vec<_> = (16..21).map(oob).collect();
        let out = decode_output_buffer(&buffer(4, &records), ObjectHandle::None, &lookup());
        assert_eq!(out.records.len(), 4);
        assert_eq!(out.dropped, 1);
        let notices: Vec<_> = out
            .reports
            .iter()
            .filter(|r| r.rule_id == rules::RESULTS_TRUNCATED)
            .collect();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].message.starts_with("1 diagnostic records"));
    }

    #[test]
    fn decoding_twice_is_identical() {
        let words = buffer(2, &[oob(17), oob(30), oob(31)]);
        let first = decode_output_buffer(&words, ObjectHandle::None, &lookup());
        let second = decode_output_buffer(&words, ObjectHandle::None, &lookup());
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_slots_are_reported_and_skipped() {
        let mut words = buffer(3, &[oob(17), oob(18)]);
        // Unknown kind in slot 0.
        words[HEADER_WORDS] = 77;
        let out = decode_output_buffer(&words, ObjectHandle::None, &lookup());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.malformed, 1);
        assert!(out
            .reports
            .iter()
            .any(|r| r.rule_id == rules::MALFORMED_RECORD && r.message.contains("slot 0")));
    }

    #[test]
    fn short_buffers_are_clamped() {
        let mut words = buffer(4, &[oob(17), oob(18)]);
        words.truncate(HEADER_WORDS + RECORD_WORDS);
        let out = decode_output_buffer(&words, ObjectHandle::None, &lookup());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.malformed, 1);

        let out = decode_output_buffer(&[1, 2], ObjectHandle::None, &lookup());
        assert!(out.records.is_empty());
        assert_eq!(out.reports[0].rule_id, rules::MALFORMED_RECORD);
    }

    #[test]
    fn unwritten_slots_are_skipped() {
        let mut words = buffer(4, &[oob(17)]);
        // A second invocation claimed a slot but its writes are not visible.
        words[COUNTER_WORD] = 2;
        let out = decode_output_buffer(&words, ObjectHandle::None, &lookup());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.malformed, 0);
    }

    #[test]
    fn debug_printf_is_formatted() {
        let printf = DiagnosticRecord {
            shader_id: 1,
            location: 52,
            execution_model: op::execution_model::GL_COMPUTE,
            stage: [0; 3],
            payload: Payload::DebugPrintf {
                format_index: 0,
                arg_words: 2,
                args: vec![3, 4],
            },
        };
        let out = decode_output_buffer(&buffer(1, &[printf]), ObjectHandle::None, &lookup());
        let report = &out.reports[0];
        assert_eq!(report.rule_id, rules::DEBUG_PRINTF);
        assert_eq!(report.severity, Severity::Info);
        assert!(report.message.starts_with("x=3 y=4 (in blur.comp"), "{}", report.message);
    }

    #[test]
    fn printf_with_unknown_format_is_malformed() {
        let printf = DiagnosticRecord {
            shader_id: 1,
            location: 52,
            execution_model: 0,
            stage: [0; 3],
            payload: Payload::DebugPrintf {
                format_index: 5,
                arg_words: 0,
                args: Vec::new(),
            },
        };
        let out = decode_output_buffer(&buffer(1, &[printf]), ObjectHandle::None, &lookup());
        assert_eq!(out.reports.len(), 1);
        assert_eq!(out.reports[0].rule_id, rules::MALFORMED_RECORD);
        assert!(out.reports[0].message.starts_with("record slot 0: debug printf record names format 5"));
        assert_eq!(out.malformed, 1);
        assert!(out.records.is_empty());
    }
}
