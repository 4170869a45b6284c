/*!
Phase-fair reader/writer lock.

Readers and writers proceed in alternating phases: a reader arriving while a
writer waits blocks until that writer's phase completes, and a writer never
overtakes the readers of the current phase. Four 16-bit counters packed into
two words: reader in/out and writer in/out ticks, with the writer presence
bits folded into the reader-in word.
*/

use std::sync::atomic::{AtomicU32, Ordering};

use crate::utils::doze;

// rin layout: reader count in the high bits, writer presence/phase in the
// two low bits.
const RINC: u32 = 0x100;
const WBITS: u32 = 0x3;
const PRES: u32 = 0x2;
const PHID: u32 = 0x1;

/// Phase-fair RW lock.
#[repr(C)]
pub struct PfLock {
    rin: AtomicU32,
    rout: AtomicU32,
    win: AtomicU32,
    wout: AtomicU32,
}

impl PfLock {
    pub const fn new() -> Self {
        Self {
            rin: AtomicU32::new(0),
            rout: AtomicU32::new(0),
            win: AtomicU32::new(0),
            wout: AtomicU32::new(0),
        }
    }

    pub fn acquire_rd(&self) {
        // Announce ourselves; snapshot the writer presence bits.
        let w = self.rin.fetch_add(RINC, Ordering::Acquire) & WBITS;
        if w != 0 {
            // A writer is present: wait until it changes phase.
            while self.rin.load(Ordering::Acquire) & WBITS == w {
                doze();
            }
        }
    }

    pub fn release_rd(&self) {
        self.rout.fetch_add(RINC, Ordering::Release);
    }

    pub fn acquire_wr(&self) {
        // Writers serialize on a ticket pair.
        let wticket = self.win.fetch_add(1, Ordering::Relaxed);
        while self.wout.load(Ordering::Acquire) != wticket {
            doze();
        }
        // Mark writer present, flipping the phase id, and snapshot the
        // reader count at this instant.
        let w = PRES | (wticket & PHID);
        let rticket = self.rin.fetch_add(w, Ordering::Acquire) & !WBITS;
        // Wait for the readers of the snapshot to drain.
        while self.rout.load(Ordering::Acquire) != rticket {
            doze();
        }
    }

    pub fn release_wr(&self) {
        // Clear writer presence; readers blocked on the phase bits go.
        self.rin.fetch_and(!WBITS, Ordering::Release);
        // Admit the next writer.
        self.wout.fetch_add(1, Ordering::Release);
    }
}

impl Default for PfLock {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------
