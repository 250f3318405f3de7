//! Collections of recorded trajectories.

use crate::error::{NpgError, Result};
use crate::replay::{next_batch, Tape};
use std::fmt;
use std::sync::Arc;

/// Three index-aligned replay streams describing one trajectory collection.
///
/// For every timestep the presence masks of the three streams are identical.
#[derive(Clone)]
pub struct RolloutSet {
    /// Policy inputs
    pub inputs: Arc<dyn Tape>,
    /// Per-timestep rewards, one column per present sequence
    pub rewards: Arc<dyn Tape>,
    /// Actions drawn from the policy during collection
    pub sampled_outs: Arc<dyn Tape>,
}

impl RolloutSet {
    /// Bundles three tapes.
    pub fn new(inputs: Arc<dyn Tape>, rewards: Arc<dyn Tape>, sampled_outs: Arc<dyn Tape>) -> Self {
        Self {
            inputs,
            rewards,
            sampled_outs,
        }
    }

    /// Number of recorded timesteps.
    pub fn num_steps(&self) -> usize {
        self.inputs.len()
    }

    /// Reads all three streams and checks that they describe the same batch.
    pub fn validate(&self) -> Result<()> {
        if self.rewards.len() != self.inputs.len() || self.sampled_outs.len() != self.inputs.len() {
            return Err(NpgError::stream_read(format!(
                "stream lengths disagree: inputs {}, rewards {}, sampled {}",
                self.inputs.len(),
                self.rewards.len(),
                self.sampled_outs.len()
            )));
        }
        let inputs = self.inputs.read_all()?;
        let mut rewards = self.rewards.read_all()?;
        let mut sampled = self.sampled_outs.read_all()?;
        for (t, input) in inputs.enumerate() {
            let input = input?;
            let reward = next_batch(&mut rewards, t)?;
            let sample = next_batch(&mut sampled, t)?;
            if input.present != reward.present || input.present != sample.present {
                return Err(NpgError::stream_read(format!(
                    "presence masks disagree at timestep {}",
                    t
                )));
            }
        }
        Ok(())
    }

    /// Sum of rewards for each batch slot.
    pub fn total_rewards(&self) -> Result<Vec<f64>> {
        let mut totals: Vec<f64> = Vec::new();
        for batch in self.rewards.read_all()? {
            let batch = batch?;
            if totals.len() < batch.batch_size() {
                totals.resize(batch.batch_size(), 0.0);
            }
            let slots = batch.present.iter().enumerate().filter(|(_, &p)| p);
            for (row, (slot, _)) in slots.enumerate() {
                totals[slot] += batch.packed.row(row).sum();
            }
        }
        Ok(totals)
    }

    /// Mean of [`total_rewards`](Self::total_rewards) over all slots.
    pub fn mean_reward(&self) -> Result<f64> {
        let totals = self.total_rewards()?;
        if totals.is_empty() {
            return Ok(0.0);
        }
        Ok(totals.iter().sum::<f64>() / totals.len() as f64)
    }
}

impl fmt::Debug for RolloutSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RolloutSet")
            .field("inputs", &self.inputs.len())
            .field("rewards", &self.rewards.len())
            .field("sampled_outs", &self.sampled_outs.len())
            .finish()
    }
}
