//! Step Timeline
//!
//! Start and finish marks for the steps of one execution. Members of a
//! parallel group mark a forked timeline that is absorbed back into the
//! parent, so overlapping spans show up side by side in [`ExecutionTimeline::spans`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// What happened to a step at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct Mark {
    step: String,
    event: EventType,
    at: Instant,
}

/// One finished step, positioned relative to the start of the execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepSpan {
    pub step: String,
    pub offset_ms: u64,
    pub duration_ms: u64,
    pub success: bool,
}

impl StepSpan {
    fn end_ms(&self) -> u64 {
        self.offset_ms + self.duration_ms
    }
}

/// Ordered step marks of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    origin: Instant,
    marks: Vec<Mark>,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            marks: Vec::new(),
        }
    }

    pub fn add_event(&mut self, step: impl Into<String>, event: EventType) {
        self.marks.push(Mark {
            step: step.into(),
            event,
            at: Instant::now(),
        });
    }

    /// Takes over the marks of a forked timeline, keeping this origin.
    pub fn absorb(&mut self, other: ExecutionTimeline) {
        self.marks.extend(other.marks);
        self.marks.sort_by_key(|m| m.at);
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Steps started but not yet finished, in start order.
    pub fn in_flight(&self) -> Vec<&str> {
        let mut open: Vec<&str> = Vec::new();
        for mark in &self.marks {
            match mark.event {
                EventType::Started => open.push(&mark.step),
                EventType::Completed | EventType::Failed => {
                    if let Some(pos) = open.iter().rposition(|s| *s == mark.step) {
                        open.remove(pos);
                    }
                }
            }
        }
        open
    }

    /// Finished steps ordered by start time. A step that ran twice yields two spans.
    pub fn spans(&self) -> Vec<StepSpan> {
        let mut open: HashMap<&str, Instant> = HashMap::new();
        let mut spans = Vec::new();

        for mark in &self.marks {
            match mark.event {
                EventType::Started => {
                    open.insert(&mark.step, mark.at);
                }
                EventType::Completed | EventType::Failed => {
                    let Some(start) = open.remove(mark.step.as_str()) else {
                        continue;
                    };
                    spans.push(StepSpan {
                        step: mark.step.clone(),
                        offset_ms: start.saturating_duration_since(self.origin).as_millis() as u64,
                        duration_ms: mark.at.saturating_duration_since(start).as_millis() as u64,
                        success: mark.event == EventType::Completed,
                    });
                }
            }
        }

        spans.sort_by_key(|s| s.offset_ms);
        spans
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest number of spans overlapping at any instant.
pub fn peak_parallelism(spans: &[StepSpan]) -> usize {
    // Ends sort before starts at the same millisecond so touching spans do not overlap.
    let mut edges: Vec<(u64, i32)> = Vec::with_capacity(spans.len() * 2);
    for span in spans {
        edges.push((span.offset_ms, 1));
        edges.push((span.end_ms().max(span.offset_ms + 1), -1));
    }
    edges.sort();

    let (mut running, mut peak) = (0i32, 0i32);
    for (_, delta) in edges {
        running += delta;
        peak = peak.max(running);
    }
    peak as usize
}

/// Renders spans as fixed-width bars scaled to `total_ms`, or to the last
/// span end when that is later.
pub fn render_bars(spans: &[StepSpan], total_ms: u64, width: usize) -> Vec<String> {
    let width = width.max(1);
    let label_width = spans.iter().map(|s| s.step.chars().count()).max().unwrap_or(0).min(24);
    let total_ms = spans.iter().map(StepSpan::end_ms).fold(total_ms, u64::max);
    let scale = width as f64 / total_ms.max(1) as f64;

    spans
        .iter()
        .map(|span| {
            let lead = ((span.offset_ms as f64 * scale) as usize).min(width.saturating_sub(1));
            let fill = ((span.duration_ms as f64 * scale).round() as usize).clamp(1, width - lead);
            let label: String = span.step.chars().take(label_width).collect();
            format!(
                "{:<label_width$} |{}{}{}| {} ms",
                label,
                " ".repeat(lead),
                if span.success { "=" } else { "x" }.repeat(fill),
                " ".repeat(width - lead - fill),
                span.duration_ms,
            )
        })
        .collect()
}
