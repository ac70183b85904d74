//! End-to-end acquisition lifecycle tests against the virtual camera.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use artemis::device::sim::{SimOp, SimOptions, SimTransport};
use artemis::error::CaptureError;
use artemis::{
    AllocationMode, CameraCapture, CameraConfig, FrameStatus, IncompleteFramePolicy, MediaFormat,
    OutputFrame, PipelineHandle, Placement, Pulled, SessionState, TriggerActivation, TriggerMode,
    TriggerSelector, TriggerSource,
};

fn fast_options() -> SimOptions {
    SimOptions {
        frame_interval: Duration::from_millis(1),
        ..SimOptions::default()
    }
}

fn session(
    opts: SimOptions,
    mut config: CameraConfig,
) -> (Arc<SimTransport>, PipelineHandle, CameraCapture) {
    if config.camera_id.is_empty() {
        config.camera_id = "SIM-TEST".to_string();
    }
    let transport = Arc::new(SimTransport::new(opts));
    let pipeline = PipelineHandle::new();
    let capture = CameraCapture::new(transport.clone(), config, pipeline.clone());
    (transport, pipeline, capture)
}

fn pull_frames(capture: &mut CameraCapture, count: usize) -> Vec<OutputFrame> {
    let mut frames = Vec::with_capacity(count);
    while frames.len() < count {
        match capture.pull() {
            Pulled::Frame(frame) => frames.push(frame),
            Pulled::Cancelled => panic!("pull cancelled after {} frames", frames.len()),
        }
    }
    frames
}

fn count_ops(transport: &SimTransport, matcher: impl Fn(&SimOp) -> bool) -> usize {
    transport.operations().iter().filter(|op| matcher(op)).count()
}

#[test]
fn trigger_fields_apply_in_device_order() {
    let config = CameraConfig {
        trigger_selector: Some(TriggerSelector::FrameStart),
        trigger_mode: Some(TriggerMode::On),
        trigger_source: Some(TriggerSource::Line1),
        trigger_activation: Some(TriggerActivation::FallingEdge),
        ..CameraConfig::default()
    };
    let (transport, _pipeline, mut capture) = session(fast_options(), config);

    capture.connect().unwrap();
    capture.set_trigger_configuration().unwrap();

    let trigger_sets: Vec<(String, String)> = transport
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            SimOp::SetEnum(name, value) if name.starts_with("Trigger") => Some((name, value)),
            _ => None,
        })
        .collect();
    let expected = [
        ("TriggerSelector", "FrameStart"),
        ("TriggerActivation", "FallingEdge"),
        ("TriggerSource", "Line1"),
        ("TriggerMode", "On"),
    ];
    assert_eq!(trigger_sets.len(), expected.len());
    for ((name, value), (expected_name, expected_value)) in trigger_sets.iter().zip(expected) {
        assert_eq!(name, expected_name);
        assert_eq!(value, expected_value);
    }
}

#[test]
fn rejected_trigger_field_does_not_abort_the_sequence() {
    // The virtual camera only offers Line0..Line3 trigger sources.
    let config = CameraConfig {
        trigger_selector: Some(TriggerSelector::FrameStart),
        trigger_source: Some(TriggerSource::Action0),
        trigger_mode: Some(TriggerMode::On),
        ..CameraConfig::default()
    };
    let (transport, _pipeline, mut capture) = session(fast_options(), config);

    capture.connect().unwrap();
    let result = capture.set_trigger_configuration();
    assert!(matches!(
        result,
        Err(CaptureError::FeatureRejected { feature: "TriggerSource", .. })
    ));

    // The mode that follows the rejected source was still applied.
    assert_eq!(
        count_ops(&transport, |op| {
            matches!(op, SimOp::SetEnum(name, value) if name == "TriggerMode" && value == "On")
        }),
        1
    );
}

#[test]
fn incomplete_frames_are_dropped_by_default() {
    let opts = SimOptions {
        frame_statuses: vec![
            FrameStatus::Complete,
            FrameStatus::Incomplete,
            FrameStatus::Complete,
            FrameStatus::Complete,
            FrameStatus::Complete,
        ],
        ..fast_options()
    };
    let (_transport, _pipeline, mut capture) = session(opts, CameraConfig::default());

    capture.start().unwrap();
    capture.commit_format(MediaFormat::Gray8).unwrap();

    let frames = pull_frames(&mut capture, 4);
    let offsets: Vec<u64> = frames.iter().map(|frame| frame.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3]);
    assert!(frames.iter().all(|frame| !frame.incomplete));
    assert!(frames.iter().all(|frame| frame.offset_end == frame.offset + 1));
}

#[test]
fn incomplete_frames_are_submitted_when_configured() {
    let opts = SimOptions {
        frame_statuses: vec![
            FrameStatus::Complete,
            FrameStatus::Incomplete,
            FrameStatus::Complete,
            FrameStatus::Complete,
            FrameStatus::Complete,
        ],
        ..fast_options()
    };
    let config = CameraConfig {
        incomplete_frame_policy: IncompleteFramePolicy::Submit,
        ..CameraConfig::default()
    };
    let (_transport, _pipeline, mut capture) = session(opts, config);

    capture.start().unwrap();
    capture.commit_format(MediaFormat::Gray8).unwrap();

    let frames = pull_frames(&mut capture, 5);
    let offsets: Vec<u64> = frames.iter().map(|frame| frame.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    let flagged: Vec<bool> = frames.iter().map(|frame| frame.incomplete).collect();
    assert_eq!(flagged, vec![false, true, false, false, false]);
}

#[test]
fn cleared_running_flag_cancels_the_pull_promptly() {
    let (_transport, pipeline, mut capture) = session(fast_options(), CameraConfig::default());
    capture.connect().unwrap();

    // No acquisition is running, so no frame can ever arrive.
    pipeline.set_running(false);
    let started = Instant::now();
    assert!(matches!(capture.pull(), Pulled::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
fn format_reconfiguration_while_acquiring_restarts_cleanly() {
    let (transport, _pipeline, mut capture) = session(fast_options(), CameraConfig::default());

    capture.start().unwrap();
    capture.commit_format(MediaFormat::Gray8).unwrap();
    assert_eq!(capture.state(), SessionState::Acquiring);
    pull_frames(&mut capture, 2);

    // Mono12 doubles the payload, forcing a buffer reallocation.
    capture.commit_format(MediaFormat::Gray16Le).unwrap();
    assert_eq!(capture.state(), SessionState::Acquiring);

    let ops = transport.operations();
    let stop_position = ops
        .iter()
        .position(|op| matches!(op, SimOp::RunCommand(name) if name == "AcquisitionStop"))
        .expect("acquisition was stopped for the format change");
    let restart_position = ops
        .iter()
        .rposition(|op| matches!(op, SimOp::RunCommand(name) if name == "AcquisitionStart"))
        .expect("acquisition was restarted");
    assert!(stop_position < restart_position);

    assert_eq!(count_ops(&transport, |op| matches!(op, SimOp::Revoke)), 10);
    assert_eq!(count_ops(&transport, |op| matches!(op, SimOp::Announce)), 20);

    let frame = pull_frames(&mut capture, 1).remove(0);
    assert_eq!(frame.format, MediaFormat::Gray16Le);
    assert_eq!(frame.data.len(), 1920 * 1080 * 2);
    assert_eq!(frame.stride[0], 1920 * 2);
}

#[test]
fn stop_revokes_every_announced_buffer() {
    let (transport, _pipeline, mut capture) = session(fast_options(), CameraConfig::default());

    capture.start().unwrap();
    capture.commit_format(MediaFormat::Gray8).unwrap();
    pull_frames(&mut capture, 1);
    capture.stop();
    capture.disconnect();

    let announces = count_ops(&transport, |op| matches!(op, SimOp::Announce));
    let revokes = count_ops(&transport, |op| matches!(op, SimOp::Revoke));
    assert_eq!(announces, revokes);
    assert_eq!(capture.state(), SessionState::Disconnected);
}

#[test]
fn centered_offsets_round_to_the_device_lattice() {
    let config = CameraConfig {
        width: Some(640),
        height: Some(500),
        offset_x: Placement::Centered,
        offset_y: Placement::Centered,
        ..CameraConfig::default()
    };
    let (transport, _pipeline, mut capture) = session(fast_options(), config);

    capture.connect().unwrap();
    capture.set_region_of_interest().unwrap();

    let last_offset = |name: &str| {
        transport
            .operations()
            .iter()
            .filter_map(|op| match op {
                SimOp::SetInt(feature, value) if feature == name => Some(*value),
                _ => None,
            })
            .last()
    };
    // (1920 - 640) / 2 is already on the step-4 lattice.
    assert_eq!(last_offset("OffsetX"), Some(640));
    // (1080 - 500) / 2 = 290 sits halfway between 288 and 292; ties go down.
    assert_eq!(last_offset("OffsetY"), Some(288));
}

#[test]
fn unset_extents_use_the_full_sensor() {
    let (transport, _pipeline, mut capture) = session(fast_options(), CameraConfig::default());

    capture.connect().unwrap();
    capture.set_region_of_interest().unwrap();

    let set_ints: Vec<(String, i64)> = transport
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            SimOp::SetInt(name, value) => Some((name, value)),
            _ => None,
        })
        .collect();
    assert!(set_ints.contains(&("Width".to_string(), 1920)));
    assert!(set_ints.contains(&("Height".to_string(), 1080)));
}

#[test]
fn exposure_falls_back_to_the_legacy_feature_name() {
    let opts = SimOptions {
        missing_features: HashSet::from(["ExposureTime".to_string()]),
        ..fast_options()
    };
    let config = CameraConfig {
        exposure_time: 2000.0,
        ..CameraConfig::default()
    };
    let (transport, _pipeline, mut capture) = session(opts, config);

    capture.connect().unwrap();
    capture.configure().unwrap();

    assert_eq!(
        count_ops(&transport, |op| {
            matches!(op, SimOp::SetFloat(name, value) if name == "ExposureTimeAbs" && *value == 2000.0)
        }),
        1
    );
}

#[test]
fn settings_file_replaces_individual_feature_application() {
    let config = CameraConfig {
        settings_file: Some("factory-tuned.xml".into()),
        exposure_time: 1234.0,
        ..CameraConfig::default()
    };
    let (transport, _pipeline, mut capture) = session(fast_options(), config);

    capture.start().unwrap();

    assert_eq!(
        count_ops(&transport, |op| matches!(op, SimOp::LoadSettings(_))),
        1
    );
    // Individual feature properties are ignored alongside a settings file.
    assert_eq!(
        count_ops(&transport, |op| matches!(op, SimOp::SetFloat(name, _) if name == "ExposureTime")),
        0
    );
}

#[test]
fn partial_announce_failure_revokes_the_announced_subset() {
    let opts = SimOptions {
        fail_announce_at: Some(3),
        ..fast_options()
    };
    let (transport, _pipeline, mut capture) = session(opts, CameraConfig::default());

    capture.connect().unwrap();
    let result = capture.commit_format(MediaFormat::Gray8);
    assert!(matches!(result, Err(CaptureError::ResourceExhausted(_))));
    assert_ne!(capture.state(), SessionState::Acquiring);

    assert_eq!(count_ops(&transport, |op| matches!(op, SimOp::Announce)), 3);
    assert_eq!(count_ops(&transport, |op| matches!(op, SimOp::Revoke)), 3);
}

#[test]
fn transport_allocated_buffers_stream_frames() {
    let config = CameraConfig {
        allocation_mode: AllocationMode::TransportAllocated,
        ..CameraConfig::default()
    };
    let (_transport, _pipeline, mut capture) = session(fast_options(), config);

    capture.start().unwrap();
    capture.commit_format(MediaFormat::Rgb).unwrap();

    let frame = pull_frames(&mut capture, 1).remove(0);
    assert_eq!(frame.data.len(), 1920 * 1080 * 3);
    assert_eq!(frame.plane_count, 1);
    assert_eq!(frame.stride[0], 1920 * 3);
}

#[test]
fn unknown_camera_id_fails_to_connect() {
    let config = CameraConfig {
        camera_id: String::new(),
        ..CameraConfig::default()
    };
    let transport = Arc::new(SimTransport::new(fast_options()));
    let mut capture = CameraCapture::new(transport, config, PipelineHandle::new());

    assert!(matches!(capture.connect(), Err(CaptureError::DeviceOpen { .. })));
    assert_eq!(capture.state(), SessionState::Disconnected);
}

#[test]
fn caps_report_current_extent_and_mapped_formats() {
    let (_transport, _pipeline, mut capture) = session(fast_options(), CameraConfig::default());

    capture.connect().unwrap();
    let caps = capture.query_caps().unwrap();

    assert_eq!(caps.width, 1920);
    assert_eq!(caps.height, 1080);
    assert!(caps.raw_formats.contains(&MediaFormat::Gray8));
    assert!(caps.raw_formats.contains(&MediaFormat::Gray16Le));
    assert!(caps.raw_formats.contains(&MediaFormat::Rgb));
    assert_eq!(caps.mosaic_formats, vec![MediaFormat::BayerRggb]);
}

#[test]
fn committing_an_unmapped_format_is_rejected() {
    let (_transport, _pipeline, mut capture) = session(fast_options(), CameraConfig::default());

    capture.connect().unwrap();
    let result = capture.commit_format(MediaFormat::Bgra);
    assert!(matches!(result, Err(CaptureError::FormatNegotiation { requested: "BGRA" })));
}

#[test]
fn sequence_numbers_survive_a_stop_start_cycle() {
    let (_transport, _pipeline, mut capture) = session(fast_options(), CameraConfig::default());

    capture.start().unwrap();
    capture.commit_format(MediaFormat::Gray8).unwrap();
    pull_frames(&mut capture, 2);

    capture.stop();
    capture.commit_format(MediaFormat::Gray8).unwrap();

    // Emission numbering is per session, not per acquisition run.
    let frame = pull_frames(&mut capture, 1).remove(0);
    assert_eq!(frame.offset, 2);
}
