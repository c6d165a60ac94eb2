mod common;

use common::{compute_setup, engine, record_and_submit};
use gpuav::driver::CommandBufferHandle;
use gpuav::protocol::{BufferCheck, DiagnosticRecord, Payload};
use gpuav::{rules, GpuAvConfig, Severity};
use gpuav_spirv::{op, test_utils};

fn run_with_records(capacity: u32, produced: u32) -> Vec<gpuav::ViolationReport> {
    let config = GpuAvConfig {
        buffer_capacity: capacity,
        ..GpuAvConfig::default()
    };
    let (engine, sink) = engine(config);
    let setup = compute_setup(&engine, &test_utils::ssbo_runtime_array_loop(16), 60);
    let cmd = CommandBufferHandle(1);
    let token = record_and_submit(&engine, &setup, cmd);
    let output = engine.diagnostic_buffer(cmd).unwrap();
    let shader = &engine.pipeline_records(setup.pipeline)[0];
    let location = *shader.sites.keys().next().unwrap();

    let records: Vec<_> = (0..produced)
        .map(|invocation| DiagnosticRecord {
            shader_id: shader.shader_id,
            location,
            execution_model: op::execution_model::GL_COMPUTE,
            stage: [invocation, 0, 0],
            payload: Payload::BufferOob {
                set: 0,
                binding: 0,
                element: 0,
                value: 64,
                limit: 60,
                check: BufferCheck::BoundRange,
            },
        })
        .collect();
    engine.driver().gpu_write(output, &records);
    engine.driver().complete(token);
    assert_eq!(engine.poll_completions(), 1);
    sink.take()
}

#[test]
fn exactly_capacity_records_are_not_truncated() {
    let reports = run_with_records(4, 4);
    assert_eq!(reports.len(), 4);
    assert!(reports.iter().all(|r| r.rule_id == rules::BUFFER_OOB));
}

#[test]
fn one_past_capacity_adds_a_single_truncation_notice() {
    let reports = run_with_records(4, 5);
    assert_eq!(reports.len(), 5);
    assert_eq!(
        reports.iter().filter(|r| r.rule_id == rules::BUFFER_OOB).count(),
        4
    );
    let last = reports.last().unwrap();
    assert_eq!(last.rule_id, rules::RESULTS_TRUNCATED);
    assert_eq!(last.severity, Severity::Warning);
    assert!(last.message.starts_with("1 diagnostic records were dropped"), "{}", last.message);
}

#[test]
fn clean_run_reports_nothing() {
    assert!(run_with_records(8, 0).is_empty());
}

#[test]
fn output_buffer_is_reinitialized_on_reuse() {
    let (engine, sink) = engine(GpuAvConfig::default());
    let setup = compute_setup(&engine, &test_utils::ssbo_runtime_array_loop(16), 60);
    let cmd = CommandBufferHandle(1);

    let token = record_and_submit(&engine, &setup, cmd);
    let output = engine.diagnostic_buffer(cmd).unwrap();
    let shader = &engine.pipeline_records(setup.pipeline)[0];
    let location = *shader.sites.keys().next().unwrap();
    engine.driver().gpu_write(
        output,
        &[DiagnosticRecord {
            shader_id: shader.shader_id,
            location,
            execution_model: op::execution_model::GL_COMPUTE,
            stage: [0; 3],
            payload: Payload::BufferOob {
                set: 0,
                binding: 0,
                element: 0,
                value: 64,
                limit: 60,
                check: BufferCheck::BoundRange,
            },
        }],
    );
    engine.driver().complete(token);
    engine.poll_completions();
    assert_eq!(sink.take().len(), 1);

    // Same buffer comes back from the pool with a clean header.
    let token = record_and_submit(&engine, &setup, cmd);
    assert_eq!(engine.diagnostic_buffer(cmd), Some(output));
    let words = engine.driver().buffer_words(output);
    assert_eq!(&words[..2], &[0, GpuAvConfig::default().buffer_capacity]);
    engine.driver().complete(token);
    engine.poll_completions();
    assert!(sink.take().is_empty());
}
