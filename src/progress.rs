use indicatif::{ProgressBar, ProgressStyle};

/// Receives one tick for every result handed to the consumer of a run.
pub trait ProgressObserver {
    fn advance(&mut self);

    /// Called once when the run is torn down, whether it completed or not.
    fn finish(&mut self) {}

    /// Runs `f` with the indicator hidden, so text printed meanwhile does not
    /// tear it.
    fn suspend(&self, f: &mut dyn FnMut()) {
        f()
    }
}

/// Creates an observer for a labelled run of `total` items.
///
/// The sink is only consulted when a run has a progress label, so a run
/// without one never builds an observer at all.
pub trait ProgressSink {
    fn start(&self, label: &str, total: usize) -> Box<dyn ProgressObserver + Send>;
}

impl<F> ProgressSink for F
where
    F: Fn(&str, usize) -> Box<dyn ProgressObserver + Send>,
{
    fn start(&self, label: &str, total: usize) -> Box<dyn ProgressObserver + Send> {
        self(label, total)
    }
}

/// Draws an `indicatif` bar on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct BarSink;

impl ProgressSink for BarSink {
    fn start(&self, label: &str, total: usize) -> Box<dyn ProgressObserver + Send> {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.green/white}] {pos:>7}/{len:7} {msg}")
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(label.to_string());
        Box::new(BarObserver { bar })
    }
}

pub struct BarObserver {
    bar: ProgressBar,
}

impl ProgressObserver for BarObserver {
    fn advance(&mut self) {
        self.bar.inc(1);
    }

    fn suspend(&self, f: &mut dyn FnMut()) {
        self.bar.suspend(f)
    }

    fn finish(&mut self) {
        if self.bar.position() >= self.bar.length().unwrap_or(0) {
            self.bar.finish();
        } else {
            self.bar.abandon();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_observer_finishes_when_complete() {
        let mut observer = BarSink.start("test", 2);
        let mut printed = false;
        observer.suspend(&mut || printed = true);
        assert!(printed);
        observer.advance();
        observer.advance();
        observer.finish();
    }

    #[test]
    fn closures_are_sinks() {
        struct Nop;
        impl ProgressObserver for Nop {
            fn advance(&mut self) {}
        }

        let sink = |_label: &str, _total: usize| Box::new(Nop) as Box<dyn ProgressObserver + Send>;
        let mut observer = sink.start("closure", 3);
        observer.advance();
        observer.finish();
    }
}
