//! The single-line terminal status renderer.

use std::time::{Duration, Instant};

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Redraws are rate-limited so a busy scheduler doesn't spend its time
/// painting the terminal.
const REDRAW_INTERVAL: Duration = Duration::from_millis(10);

pub struct EngineStat {
    pub label: String,
    pub running: usize,
    pub max: usize,
}

pub struct StatusSnapshot {
    pub queued: usize,
    pub engines: Vec<EngineStat>,
    pub finished: usize,
    pub remaining: usize,
    pub cost: f64,
}

pub struct StatusLine {
    bar: ProgressBar,
    last_display: Instant,
}

impl StatusLine {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
        bar.set_style(ProgressStyle::with_template("{msg}").expect("static template"));

        let last_display = Instant::now()
            .checked_sub(REDRAW_INTERVAL)
            .unwrap_or_else(Instant::now);

        Self { bar, last_display }
    }

    pub fn refresh(&mut self, snapshot: StatusSnapshot) {
        if self.last_display.elapsed() < REDRAW_INTERVAL {
            return;
        }
        self.last_display = Instant::now();

        let mut line = format!(
            "in queue: {:<5}",
            style(snapshot.queued).yellow().bold()
        );

        for engine in &snapshot.engines {
            line.push_str(&format!(
                " {} ({}): {:<5}",
                engine.label,
                engine.max,
                style(engine.running).red().bold()
            ));
        }

        line.push_str(&format!(
            " done: {:<5} remaining: {}  |  cost: {}",
            style(snapshot.finished).green().bold(),
            style(snapshot.remaining).bold(),
            style(format!("~${:.2}", snapshot.cost)).cyan().bold()
        ));

        self.bar.set_message(line);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new()
    }
}
