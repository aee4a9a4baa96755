//! Expands the configured condition list into an ordered trial list.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ExperimentConfig;
use crate::error::ConfigError;
use crate::waveform::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialMethod {
    /// Repeat the list in order.
    #[default]
    Sequential,
    /// Shuffle within each repetition.
    Random,
    /// Shuffle the fully expanded list.
    FullRandom,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTrial {
    /// 1-based.
    pub trial_num: u32,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialSchedule {
    trials: Vec<ScheduledTrial>,
}

impl TrialSchedule {
    pub fn build<R: Rng + ?Sized>(
        config: &ExperimentConfig,
        session: u32,
        rng: &mut R,
    ) -> Result<Self, ConfigError> {
        let mut names = config.trial.conditions.clone();
        if config.trial.counterbalance && session % 2 == 0 {
            names.reverse();
        }

        let block: Vec<&Condition> = names
            .iter()
            .map(|name| {
                config
                    .condition(name)
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown condition '{name}'")))
            })
            .collect::<Result<_, _>>()?;

        let mut order: Vec<&Condition> = Vec::with_capacity(block.len() * config.trial.n_reps as usize);
        for _ in 0..config.trial.n_reps {
            let mut rep = block.clone();
            if config.trial.method == TrialMethod::Random {
                rep.shuffle(rng);
            }
            order.extend(rep);
        }
        if config.trial.method == TrialMethod::FullRandom {
            order.shuffle(rng);
        }

        let trials = order
            .into_iter()
            .zip(1..)
            .map(|(condition, trial_num)| ScheduledTrial {
                trial_num,
                condition: condition.clone(),
            })
            .collect();
        Ok(Self { trials })
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledTrial> {
        self.trials.iter()
    }
}
