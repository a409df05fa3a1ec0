use indicatif::{ProgressBar, ProgressStyle};

/// Observer of completed-result counts.
///
/// Sinks are purely decorative: they never change ordering or results.
pub trait ProgressSink {
    /// Called once per completed result with the running count.
    fn tick(&mut self, completed: usize, total: Option<usize>);

    /// Called once when the wrapped iterator is exhausted or dropped.
    fn finish(&mut self) {}
}

impl<F> ProgressSink for F
where
    F: FnMut(usize, Option<usize>),
{
    fn tick(&mut self, completed: usize, total: Option<usize>) {
        self(completed, total)
    }
}

/// Sink that reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn tick(&mut self, _completed: usize, _total: Option<usize>) {}
}

/// Terminal progress bar backed by indicatif.
///
/// The bar draws to stderr, hides itself when stderr is not a terminal, and is
/// cleared when finished.
#[derive(Clone)]
pub struct IndicatifSink {
    bar: ProgressBar,
}

impl IndicatifSink {
    pub fn new(total: Option<usize>) -> Self {
        let bar = match total {
            Some(total) => {
                let bar = ProgressBar::new(total as u64);
                let style = ProgressStyle::with_template(
                    "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} items ({percent}%) eta {eta}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  ");
                bar.set_style(style);
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                let style = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {pos} items")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner());
                bar.set_style(style);
                bar
            }
        };
        Self { bar }
    }

    /// Wrap an existing bar, e.g. one added to a `MultiProgress`.
    pub fn from_bar(bar: ProgressBar) -> Self {
        Self { bar }
    }

    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }
}

impl ProgressSink for IndicatifSink {
    fn tick(&mut self, completed: usize, _total: Option<usize>) {
        self.bar.set_position(completed as u64);
    }

    fn finish(&mut self) {
        self.bar.finish_and_clear();
    }
}

/// Pull-based iterator wrapper that reports each item it yields to a sink.
pub struct Progress<I, S: ProgressSink> {
    inner: I,
    sink: S,
    completed: usize,
    total: Option<usize>,
    finished: bool,
}

impl<I, S: ProgressSink> Progress<I, S> {
    pub fn new(inner: I, sink: S, total: Option<usize>) -> Self {
        Self {
            inner,
            sink,
            completed: 0,
            total,
            finished: false,
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.sink.finish();
        }
    }
}

impl<I: Iterator, S: ProgressSink> Iterator for Progress<I, S> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some(item) => {
                self.completed += 1;
                self.sink.tick(self.completed, self.total);
                Some(item)
            }
            None => {
                self.finish();
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<I, S: ProgressSink> Drop for Progress<I, S> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Adds `with_progress` to every iterator.
pub trait ProgressExt: Iterator + Sized {
    fn with_progress<S: ProgressSink>(self, sink: S, total: Option<usize>) -> Progress<Self, S> {
        Progress::new(self, sink, total)
    }
}

impl<I: Iterator> ProgressExt for I {}
