// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It drives the synthetic activity source, benchmarks and randomized tests so
// runs are reproducible from a seed.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform in [0,1) with 53 bits of resolution.
    #[inline]
    pub fn next_f64_01(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    #[inline]
    pub fn gen_range_f64(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        low + (self.next_u64() % span) as usize
    }

    /// Poisson-distributed count (Knuth). Intended for the small per-frame
    /// rates of the synthetic source; large `rate` values are slow.
    pub fn poisson(&mut self, rate: f64) -> u32 {
        if !(rate > 0.0) {
            return 0;
        }
        let limit = (-rate).exp();
        let mut k = 0u32;
        let mut p = self.next_f64_01();
        while p > limit {
            k += 1;
            p *= self.next_f64_01();
        }
        k
    }
}
