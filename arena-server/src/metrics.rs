//! Counter hooks exposed over `/metrics`. The set is deliberately small;
//! anything heavier belongs to the ops stack outside this server.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde_json::{json, Value};

pub struct Metrics {
    registry: Registry,
    pub ticks: IntCounter,
    pub sessions: IntGauge,
    pub frames_out: IntCounter,
    pub challenge_events: IntCounterVec,
    pub escrow_calls: IntCounterVec,
    pub bus_messages: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let ticks = IntCounter::new("arena_ticks_total", "Completed simulation ticks")
            .expect("metric definition");
        let sessions =
            IntGauge::new("arena_sessions", "Open player sessions").expect("metric definition");
        let frames_out = IntCounter::new("arena_frames_out_total", "Frames sent to sessions")
            .expect("metric definition");
        let challenge_events = IntCounterVec::new(
            Opts::new("arena_challenge_events_total", "Challenge transitions"),
            &["event"],
        )
        .expect("metric definition");
        let escrow_calls = IntCounterVec::new(
            Opts::new("arena_escrow_calls_total", "Escrow phases by outcome"),
            &["phase", "ok"],
        )
        .expect("metric definition");
        let bus_messages = IntCounter::new("arena_bus_messages_total", "Bus deliveries consumed")
            .expect("metric definition");

        for collector in [
            Box::new(ticks.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(sessions.clone()),
            Box::new(frames_out.clone()),
            Box::new(challenge_events.clone()),
            Box::new(escrow_calls.clone()),
            Box::new(bus_messages.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Self {
            registry,
            ticks,
            sessions,
            frames_out,
            challenge_events,
            escrow_calls,
            bus_messages,
        }
    }

    pub fn text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    pub fn json(&self) -> Value {
        json!({
            "ticks": self.ticks.get(),
            "sessions": self.sessions.get(),
            "framesOut": self.frames_out.get(),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
