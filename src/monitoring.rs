// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Process-wide monitoring point publisher.
//!
//! Fire-and-forget: tasks submit named points each cycle; a pluggable
//! sink carries them off-process. Before `init` (and after `destroy`)
//! submissions are dropped silently, so library code never has to care
//! whether monitoring is wired up. The publisher keeps the latest value
//! of every point, which is also what the tests inspect.

use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::trace;

#[derive(Clone, Debug, PartialEq)]
pub enum MonitorValue {
    I32(i32),
    U32(u32),
    F32(f32),
    F64(f64),
    Str(String),
}

impl From<i32> for MonitorValue {
    fn from(v: i32) -> Self {
        MonitorValue::I32(v)
    }
}

impl From<u32> for MonitorValue {
    fn from(v: u32) -> Self {
        MonitorValue::U32(v)
    }
}

impl From<f32> for MonitorValue {
    fn from(v: f32) -> Self {
        MonitorValue::F32(v)
    }
}

impl From<f64> for MonitorValue {
    fn from(v: f64) -> Self {
        MonitorValue::F64(v)
    }
}

impl From<&str> for MonitorValue {
    fn from(v: &str) -> Self {
        MonitorValue::Str(v.to_string())
    }
}

/// Destination for monitoring points. Implementations must be cheap and
/// non-blocking; the pipeline hot path calls into this.
pub trait MonitorSink: Send {
    fn publish(&self, name: &str, value: &MonitorValue);
    fn invalidate(&self, name: &str);
}

/// Default sink: points go to the trace log.
struct LogSink;

impl MonitorSink for LogSink {
    fn publish(&self, name: &str, value: &MonitorValue) {
        trace!("monitoring: {name} = {value:?}");
    }

    fn invalidate(&self, name: &str) {
        trace!("monitoring: {name} invalidated");
    }
}

struct Monitoring {
    sink: Option<Box<dyn MonitorSink>>,
    points: HashMap<String, MonitorValue>,
}

lazy_static! {
    static ref MONITORING: Mutex<Monitoring> = Mutex::new(Monitoring {
        sink: None,
        points: HashMap::new(),
    });
}

/// Install the default log-backed sink.
pub fn init() {
    init_with(Box::new(LogSink));
}

/// Install a custom sink.
pub fn init_with(sink: Box<dyn MonitorSink>) {
    let mut mon = MONITORING.lock().unwrap();
    mon.sink = Some(sink);
}

/// Tear down the publisher. Safe to call even if `init` never ran.
pub fn destroy() {
    let mut mon = MONITORING.lock().unwrap();
    mon.sink = None;
    mon.points.clear();
}

/// Submit a point. Dropped silently when no sink is installed.
pub fn update<V: Into<MonitorValue>>(name: &str, value: V) {
    let mut mon = MONITORING.lock().unwrap();
    if mon.sink.is_none() {
        return;
    }
    let value = value.into();
    if let Some(sink) = &mon.sink {
        sink.publish(name, &value);
    }
    mon.points.insert(name.to_string(), value);
}

/// Withdraw a point, e.g. when the producing task winds down.
pub fn invalidate(name: &str) {
    let mut mon = MONITORING.lock().unwrap();
    if let Some(sink) = &mon.sink {
        sink.invalidate(name);
    }
    mon.points.remove(name);
}

/// Latest value of a point, if any. Used by tests.
pub fn get(name: &str) -> Option<MonitorValue> {
    MONITORING.lock().unwrap().points.get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The singleton is process-wide, so keep all assertions in one test
    // to avoid cross-test interference.
    #[test]
    fn lifecycle_and_points() {
        // Before init, updates are dropped.
        destroy();
        update("PacketsLostCount", 5);
        assert_eq!(get("PacketsLostCount"), None);

        init();
        update("PacketsLostCount", 5);
        update("BufferUsagePercent", 12.5f32);
        assert_eq!(get("PacketsLostCount"), Some(MonitorValue::I32(5)));
        assert_eq!(get("BufferUsagePercent"), Some(MonitorValue::F32(12.5)));

        invalidate("PacketsLostCount");
        assert_eq!(get("PacketsLostCount"), None);

        destroy();
        assert_eq!(get("BufferUsagePercent"), None);
    }
}
