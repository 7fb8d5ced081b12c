//! End-to-end runs against a scripted mock link: a full multi-trace
//! protocol, and a link loss mid-experiment healed by the watchdog.

use pispec::adapters::{MockFactory, MockHandle};
use pispec::config::LinkSettings;
use pispec::data::MemorySink;
use pispec::engine::{Action, ExperimentEngine};
use pispec::link::{DeviceLink, LinkState};
use pispec::parameter::ParameterSet;
use pispec::trace::TraceStatus;
use pispec::watchdog::ConnectionWatchdog;
use std::sync::Arc;
use std::time::Duration;

fn quick_params(note: &str, led: u8) -> ParameterSet {
    ParameterSet {
        num_points: 10,
        pulse_interval: 100,
        pulse_length: 50,
        meas_led_ir: led,
        trace_note: note.to_string(),
        ..ParameterSet::default()
    }
}

fn test_link(factory: Arc<MockFactory>) -> DeviceLink {
    let settings = LinkSettings {
        adc_timeout_ms: 100,
        ..LinkSettings::default()
    };
    DeviceLink::new(factory, &settings)
}

#[tokio::test]
async fn two_wavelength_protocol_accumulates_ordered_records() {
    let handle = MockHandle::new();
    let factory = Arc::new(MockFactory::new(handle.clone()));
    let link = test_link(factory);
    link.connect().await.unwrap();

    let sink = MemorySink::new();
    let mut engine = ExperimentEngine::new(link, Box::new(sink.clone()));

    handle.queue_response(b"0,150,3301\r\n1,300,3290\r\n;");
    handle.queue_response(b"0,150,2975\r\n1,300,2968\r\n;");

    engine.load_experiment(
        vec![
            Action::SetParameters(quick_params("800nm", 5)),
            Action::Wait(0.02),
            Action::ExecuteTrace,
            Action::SaveData,
            Action::SetParameters(quick_params("900nm", 6)),
            Action::Wait(0.02),
            Action::ExecuteTrace,
            Action::SaveData,
            Action::EndStep,
        ],
        true,
    );
    engine.run().await.unwrap();

    let saved = sink.saved();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].note, "800nm");
    assert_eq!(saved[1].note, "900nm");
    assert_eq!(saved[0].trace_num, 0);
    assert_eq!(saved[1].trace_num, 1);
    assert!(saved.iter().all(|r| r.status == TraceStatus::Completed));
    // Each record carries the parameter string in force for its trace.
    assert!(saved[0].param_string.contains("r5;"));
    assert!(saved[1].param_string.contains("r6;"));
}

#[tokio::test]
async fn link_loss_mid_experiment_heals_without_losing_position() {
    let handle = MockHandle::new();
    let factory = Arc::new(MockFactory::new(handle.clone()));
    let link = test_link(factory);
    link.connect().await.unwrap();

    let mut watchdog = ConnectionWatchdog::spawn(link.clone(), Duration::from_millis(10));

    let sink = MemorySink::new();
    let mut engine = ExperimentEngine::new(link.clone(), Box::new(sink.clone()));

    // First leg succeeds.
    handle.queue_response(b"0,150,3301\r\n;");
    engine.load_experiment(
        vec![
            Action::SetParameters(quick_params("800nm", 5)),
            Action::ExecuteTrace,
        ],
        true,
    );
    engine.run().await.unwrap();
    assert_eq!(engine.trace_count(), 1);

    // Cable pulled between legs; the watchdog notices and reconnects.
    handle.sever();
    let mut reconnected = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if link.state() == LinkState::Connected && link.is_connected() {
            reconnected = true;
            break;
        }
    }
    assert!(reconnected, "watchdog did not restore the link");

    // Resume without resetting: position and counter are intact.
    handle.queue_response(b"0,150,2975\r\n;");
    engine.load_experiment(vec![Action::ExecuteTrace, Action::SaveData, Action::EndStep], false);
    engine.run().await.unwrap();

    assert_eq!(engine.trace_count(), 2);
    let saved = sink.saved();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[1].trace_num, 1);
    assert_eq!(saved[1].status, TraceStatus::Completed);

    watchdog.shutdown().await;
}
