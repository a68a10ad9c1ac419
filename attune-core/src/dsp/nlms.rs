//! Normalized LMS adaptive filter, the adaptation core of the echo canceller.
//!
//! NLMS normalizes the step size by the instantaneous input power, giving
//! fast convergence that is independent of the far-end signal level:
//!
//! ```text
//! μ_eff  = μ / (x^T x + δ)
//! y[n]   = Σ w[k] * x[n-k]
//! e[n]   = d[n] - y[n]
//! w[k]  += μ_eff * e[n] * x[n-k]
//! ```
//!
//! Stability is guaranteed for `0 < μ < 2`. The regularization term `δ`
//! prevents division by zero when the far end is silent.
//!
//! The input power `x^T x` is maintained incrementally (add the new sample's
//! square, subtract the evicted one's) so per-sample cost stays at two
//! O(order) passes even for echo-tail-length filters.

/// Normalized Least Mean Squares adaptive filter.
pub struct NlmsFilter {
    weights: Vec<f32>,
    buffer: Vec<f32>,
    pos: usize,
    step_size: f32,
    order: usize,
    regularization: f32,
    /// Running Σ x² over the delay line, updated incrementally.
    power: f32,
}

impl NlmsFilter {
    /// Create a new NLMS filter with default regularization (δ = 1e-6).
    ///
    /// `order` is the number of taps; `step_size` is μ in (0.0, 2.0).
    pub fn new(order: usize, step_size: f32) -> Self {
        Self::with_regularization(order, step_size, 1e-6)
    }

    pub fn with_regularization(order: usize, step_size: f32, regularization: f32) -> Self {
        Self {
            weights: vec![0.0; order],
            buffer: vec![0.0; order],
            pos: 0,
            step_size,
            order,
            regularization,
            power: 0.0,
        }
    }

    /// Process one sample pair.
    ///
    /// `input` is the reference x\[n\] (far end), `desired` is d\[n\] (near
    /// end). Returns `(output, error)` where `error = desired - output` is the
    /// echo-suppressed result.
    pub fn process_sample(&mut self, input: f32, desired: f32) -> (f32, f32) {
        // Incremental power update: evict the sample being overwritten.
        let evicted = self.buffer[self.pos];
        self.power += input * input - evicted * evicted;
        // Floating-point drift can push the running sum slightly negative.
        if self.power < 0.0 {
            self.power = 0.0;
        }
        self.buffer[self.pos] = input;

        let mu_eff = self.step_size / (self.power + self.regularization);

        let mut output = 0.0f32;
        for k in 0..self.order {
            let buf_idx = (self.pos + self.order - k) % self.order;
            output += self.weights[k] * self.buffer[buf_idx];
        }

        let error = desired - output;

        let mu_e = mu_eff * error;
        for k in 0..self.order {
            let buf_idx = (self.pos + self.order - k) % self.order;
            self.weights[k] += mu_e * self.buffer[buf_idx];
        }

        self.pos = (self.pos + 1) % self.order;

        (output, error)
    }

    /// Process a block; all slices must have the same length.
    pub fn process_block(
        &mut self,
        input: &[f32],
        desired: &[f32],
        error: &mut [f32],
    ) {
        for i in 0..input.len() {
            let (_, e) = self.process_sample(input[i], desired[i]);
            error[i] = e;
        }
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Zero all weights and the delay line. Step size is preserved.
    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.buffer.fill(0.0);
        self.pos = 0;
        self.power = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simple reproducible PRNG for test determinism.
    fn next_rand(state: &mut u32) -> f32 {
        *state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (*state as i32 as f32) / (i32::MAX as f32)
    }

    fn apply_fir(signal: &[f32], taps: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; signal.len()];
        for n in 0..signal.len() {
            let mut y = 0.0;
            for (k, &tap) in taps.iter().enumerate() {
                if n >= k {
                    y += tap * signal[n - k];
                }
            }
            out[n] = y;
        }
        out
    }

    #[test]
    fn converges_to_known_fir() {
        let target_taps = [0.5f32, -0.3, 0.1];
        let mut filter = NlmsFilter::new(3, 0.5);

        let n = 2_000;
        let mut st = 7u32;
        let noise: Vec<f32> = (0..n).map(|_| next_rand(&mut st)).collect();
        let desired = apply_fir(&noise, &target_taps);

        let mut err = vec![0.0f32; n];
        filter.process_block(&noise, &desired, &mut err);

        for (k, &tap) in target_taps.iter().enumerate() {
            let w = filter.weights()[k];
            assert!(
                (w - tap).abs() < 0.05,
                "weight[{k}] = {w:.4}, expected {tap:.4}"
            );
        }
    }

    #[test]
    fn silent_input_stays_finite() {
        let mut filter = NlmsFilter::with_regularization(8, 0.5, 1e-6);
        let zeros = vec![0.0f32; 100];
        let desired = vec![0.5f32; 100];
        let mut err = vec![0.0f32; 100];
        filter.process_block(&zeros, &desired, &mut err);

        assert!(err.iter().all(|e| e.is_finite()));
        assert!(filter.weights().iter().all(|w| w.is_finite()));
    }

    #[test]
    fn incremental_power_matches_recompute() {
        let mut filter = NlmsFilter::new(16, 0.5);
        let mut st = 11u32;
        for _ in 0..500 {
            let x = next_rand(&mut st);
            let d = next_rand(&mut st);
            filter.process_sample(x, d);
            let direct: f32 = filter.buffer.iter().map(|&v| v * v).sum();
            assert!(
                (filter.power - direct).abs() < 1e-3,
                "running power {} drifted from direct {}",
                filter.power,
                direct
            );
        }
    }

    #[test]
    fn reset_clears_state() {
        let mut filter = NlmsFilter::new(4, 0.5);
        let mut st = 3u32;
        for _ in 0..200 {
            let x = next_rand(&mut st);
            filter.process_sample(x, x * 0.5);
        }
        filter.reset();
        assert!(filter.weights().iter().all(|&w| w == 0.0));
        let (out, err) = filter.process_sample(0.0, 0.0);
        assert_eq!(out, 0.0);
        assert_eq!(err, 0.0);
    }
}
