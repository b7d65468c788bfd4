use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::types::{DuskError, Result};

/// Policy that makes interruption checkpoints fail at random for one
/// connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultInjection {
    /// Connection whose operations are targeted.
    pub conn_id: u64,
    /// Chance in `[0, 1]` that a single checkpoint fails.
    pub probability: f64,
    /// Whether operations nested inside another operation are targeted too.
    #[serde(default)]
    pub include_nested: bool,
    /// Seed for the draw sequence.
    #[serde(default)]
    pub seed: u64,
}

impl FaultInjection {
    /// Injects faults into operations of `conn_id` with the given probability.
    pub fn new(conn_id: u64, probability: f64) -> Self {
        Self {
            conn_id,
            probability,
            include_nested: false,
            seed: 0,
        }
    }

    /// Also target operations nested inside another.
    pub fn include_nested(mut self, include: bool) -> Self {
        self.include_nested = include;
        self
    }

    /// Seed for the fault draw sequence.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Rejects probabilities outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(DuskError::InvalidArgument(format!(
                "fault injection probability must be in [0, 1], got {}",
                self.probability
            )));
        }
        Ok(())
    }
}

/// A validated [`FaultInjection`] with its random stream.
pub(crate) struct FaultInjector {
    policy: FaultInjection,
    rng: Mutex<ChaCha8Rng>,
}

impl FaultInjector {
    pub(crate) fn new(policy: FaultInjection) -> Result<Self> {
        policy.validate()?;
        let rng = ChaCha8Rng::seed_from_u64(policy.seed);
        Ok(Self {
            policy,
            rng: Mutex::new(rng),
        })
    }

    pub(crate) fn policy(&self) -> &FaultInjection {
        &self.policy
    }

    /// Draws for one checkpoint of an operation on `conn_id`.
    pub(crate) fn should_fail(&self, conn_id: u64, nested: bool) -> bool {
        if conn_id != self.policy.conn_id {
            return false;
        }
        if nested && !self.policy.include_nested {
            return false;
        }
        self.rng.lock().gen::<f64>() < self.policy.probability
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_outside_unit_interval_is_rejected() {
        assert!(FaultInjector::new(FaultInjection::new(1, 1.5)).is_err());
        assert!(FaultInjector::new(FaultInjection::new(1, -0.1)).is_err());
        assert!(FaultInjector::new(FaultInjection::new(1, f64::NAN)).is_err());
        assert!(FaultInjector::new(FaultInjection::new(1, 0.0)).is_ok());
    }

    #[test]
    fn only_the_target_connection_is_hit() {
        let injector = FaultInjector::new(FaultInjection::new(7, 1.0)).unwrap();
        assert!(injector.should_fail(7, false));
        assert!(!injector.should_fail(8, false));
        assert!(!injector.should_fail(7, true));

        let nested = FaultInjector::new(FaultInjection::new(7, 1.0).include_nested(true)).unwrap();
        assert!(nested.should_fail(7, true));
    }

    #[test]
    fn draws_are_reproducible_per_seed() {
        let draw = |seed| {
            let injector =
                FaultInjector::new(FaultInjection::new(1, 0.5).with_seed(seed)).unwrap();
            (0..64).map(|_| injector.should_fail(1, false)).collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
        let hits = draw(42).into_iter().filter(|hit| *hit).count();
        assert!(hits > 0 && hits < 64);
    }
}
