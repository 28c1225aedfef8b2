//! Random sampling of allowed requests.

#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    rate: f64,
}

impl Sampler {
    /// `rate` is clamped to `[0, 1]`.
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn should_sample(&self) -> bool {
        if self.rate >= 1.0 {
            true
        } else if self.rate <= 0.0 {
            false
        } else {
            fastrand::f64() < self.rate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_deterministic() {
        assert!((0..1000).all(|_| Sampler::new(1.0).should_sample()));
        assert!((0..1000).all(|_| !Sampler::new(0.0).should_sample()));
        assert_eq!(Sampler::new(7.0).rate(), 1.0);
        assert_eq!(Sampler::new(f64::NAN).rate(), 0.0);
    }

    #[test]
    fn fractional_rate_samples_roughly_that_share() {
        let sampler = Sampler::new(0.5);
        let hits = (0..10_000).filter(|_| sampler.should_sample()).count();
        assert!((4_000..6_000).contains(&hits), "{hits} of 10000 sampled");
    }
}
