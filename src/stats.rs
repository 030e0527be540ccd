use std::time::Duration;

/// Transfer totals published for the tracker collaborator's announces.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferTotals {

    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still missing from verified pieces.
    pub left: u64,

}

/// One direction of a session's byte flow. Sessions close a report
/// window on their one-second tick; the rate is whatever the last
/// window carried.
#[derive(Debug, Default, Clone, Copy)]
pub struct Flow {

    total: u64,

    // Bytes accumulated in the window still open.
    window: u64,

    // Bytes per second over the last closed window.
    rate: u64,

}

impl Flow {

    pub fn record(&mut self, n: u64) {
        self.total += n;
        self.window += n;
    }

    /// Closes the open window, converting it to a rate over `elapsed`.
    pub fn flush(&mut self, elapsed: Duration) {
        if !elapsed.is_zero() {
            self.rate = (self.window as f64 / elapsed.as_secs_f64()) as u64;
        }
        self.window = 0;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }
}

impl std::ops::AddAssign<u64> for Flow {
    fn add_assign(&mut self, n: u64) {
        self.record(n);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Throughput {

    pub up: Flow,

    pub down: Flow,

}

impl Throughput {
    pub fn flush(&mut self, elapsed: Duration) {
        self.up.flush(elapsed);
        self.down.flush(elapsed);
    }
}
