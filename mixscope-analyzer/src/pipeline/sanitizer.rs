//! Serialization guard
//!
//! Non-finite numbers become `None`, arrays and strings are truncated. Each replacement is a
//! `SerializationGuardTrip`: logged with its field path and recorded in the report diagnostics.
//! A trip never fails the job.

use tracing::warn;

pub const MAX_ARRAY_LEN: usize = 64;
pub const MAX_STRING_CHARS: usize = 512;
pub const MAX_RECORDED_TRIPS: usize = 32;

#[derive(Debug, Default)]
pub struct Sanitizer {
    trips: Vec<String>,
    total_trips: usize,
}

impl Sanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num(&mut self, path: &str, value: f64) -> Option<f64> {
        if value.is_finite() {
            Some(value)
        } else {
            self.trip(path, &format!("non-finite value {}", value));
            None
        }
    }

    pub fn opt(&mut self, path: &str, value: Option<f64>) -> Option<f64> {
        value.and_then(|v| self.num(path, v))
    }

    pub fn text(&mut self, path: &str, value: &str) -> String {
        if value.chars().count() <= MAX_STRING_CHARS {
            return value.to_string();
        }
        self.trip(path, "string truncated");
        value.chars().take(MAX_STRING_CHARS).collect()
    }

    pub fn opt_text(&mut self, path: &str, value: Option<&str>) -> Option<String> {
        value.map(|v| self.text(path, v))
    }

    pub fn cap<T>(&mut self, path: &str, mut values: Vec<T>) -> Vec<T> {
        if values.len() > MAX_ARRAY_LEN {
            self.trip(path, &format!("array of {} truncated", values.len()));
            values.truncate(MAX_ARRAY_LEN);
        }
        values
    }

    pub fn trip_count(&self) -> usize {
        self.total_trips
    }

    /// Recorded field paths (at most `MAX_RECORDED_TRIPS`)
    pub fn into_trips(self) -> Vec<String> {
        self.trips
    }

    fn trip(&mut self, path: &str, what: &str) {
        warn!(field = path, what, "SerializationGuardTrip");
        self.total_trips += 1;
        if self.trips.len() < MAX_RECORDED_TRIPS {
            self.trips.push(path.to_string());
        }
    }
}
