//! Tower height sampling.

use rand::Rng;

/// Draws node heights from a geometric distribution.
///
/// Each extra level is granted with probability `1 / branching_factor`, and the
/// result is capped at `max_height`.
#[derive(Debug, Clone, Copy)]
pub struct HeightSampler {
    max_height: usize,
    branching_factor: u32,
    /// `2^32 / branching_factor`: a uniform `u32` below this wins a level.
    scaled_inverse_branching: u64,
}

impl HeightSampler {
    pub fn new(max_height: usize, branching_factor: u32) -> HeightSampler {
        debug_assert!(max_height >= 1);
        debug_assert!(branching_factor >= 2);
        HeightSampler {
            max_height,
            branching_factor,
            scaled_inverse_branching: (u32::MAX as u64 + 1) / branching_factor as u64,
        }
    }

    pub fn max_height(&self) -> usize {
        self.max_height
    }

    pub fn branching_factor(&self) -> u32 {
        self.branching_factor
    }

    /// Samples a height with the calling thread's generator.
    pub fn sample(&self) -> usize {
        self.sample_with(&mut rand::thread_rng())
    }

    /// Samples a height with the given generator. Always in `1..=max_height`.
    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let mut height = 1;
        while height < self.max_height && (rng.gen::<u32>() as u64) < self.scaled_inverse_branching
        {
            height += 1;
        }
        height
    }
}
