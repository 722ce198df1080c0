//! Implementation of some common frame placement policies.

use super::CoreMapEntry;
use core::ops::Range;

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Send {
    /// Returns a range indicating the frame numbers to be allocated, or [`None`] if a
    /// sufficiently large range of free frames cannot be found.
    fn place(&mut self, core_map: &[CoreMapEntry], frames_requested: usize)
        -> Option<Range<usize>>;
}

#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

// No internal state. Zero-sized.
#[derive(Default)]
pub struct FirstFit;

/// Length of the run of free frames starting at `start`, capped at `limit`.
fn free_run(core_map: &[CoreMapEntry], start: usize, limit: usize) -> usize {
    core_map[start..]
        .iter()
        .take(limit)
        .take_while(|entry| !entry.allocated())
        .count()
}

impl PlacementAlgorithm for NextFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        let total_frames = core_map.len();
        if frames_requested == 0 || frames_requested > total_frames {
            return None;
        }

        let mut block_start_ind = self.position % total_frames;
        let mut wrapped_around = false;

        while !(wrapped_around && block_start_ind >= self.position) {
            if block_start_ind + frames_requested > total_frames {
                // Wrap once only. A large request may never let
                // `block_start_ind` reach `self.position` again.
                if wrapped_around {
                    break;
                }
                block_start_ind = 0;
                wrapped_around = true;
                continue;
            }

            let block_size = free_run(core_map, block_start_ind, frames_requested);
            if block_size == frames_requested {
                self.position = (block_start_ind + block_size) % total_frames;
                return Some(block_start_ind..(block_start_ind + block_size));
            }
            // Previous block too small, keep searching starting from one past the allocated frame
            block_start_ind += block_size + 1;
        }

        None
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        if frames_requested == 0 {
            return None;
        }

        let mut block_start_ind = 0;
        while block_start_ind + frames_requested <= core_map.len() {
            let block_size = free_run(core_map, block_start_ind, frames_requested);
            if block_size == frames_requested {
                return Some(block_start_ind..(block_start_ind + block_size));
            }
            block_start_ind += block_size + 1;
        }

        None
    }
}
