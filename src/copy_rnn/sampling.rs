// Copyright 2018 Rui Meng (seq2seq-keyphrase-pytorch)
// Copyright 2025 Rust CopyRNN contributors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What feeds the next decoding step.
pub enum FeedDecision {
    /// Feed the ground-truth token at the next target position (teacher forcing).
    GroundTruth,
    /// Feed the model's own top-1 prediction.
    ModelPrediction,
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Decay curve of the teacher-forcing ratio under scheduled sampling
/// ([Bengio et al., 2015](https://arxiv.org/abs/1506.03099)).
pub enum DecayCurve {
    linear,
    inverse_sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// # Teacher-forcing policy
/// Decides, per decoding step, whether the next input token is the ground truth or the
/// model's own prediction.
pub enum TeacherForcingPolicy {
    /// Always feed the ground truth.
    Always,
    /// Feed the ground truth with a fixed probability.
    Ratio(f64),
    /// Feed the ground truth with a probability that decays over `total_steps` calls.
    Decay {
        curve: DecayCurve,
        total_steps: u64,
    },
}

impl TeacherForcingPolicy {
    /// Teacher-forcing ratio after `steps_seen` decisions. Pure function of the
    /// counter, independent of any random draw.
    pub fn ratio_at(&self, steps_seen: u64) -> f64 {
        match self {
            TeacherForcingPolicy::Always => 1.0,
            TeacherForcingPolicy::Ratio(ratio) => *ratio,
            TeacherForcingPolicy::Decay {
                curve: DecayCurve::linear,
                total_steps,
            } => {
                if *total_steps == 0 {
                    0.0
                } else {
                    (1.0 - steps_seen as f64 / *total_steps as f64).max(0.0)
                }
            }
            TeacherForcingPolicy::Decay {
                curve: DecayCurve::inverse_sigmoid,
                total_steps,
            } => {
                // k/(k + e^(x - m)) with k=1, m=5; x scaled to [0, 2m] so the early
                // steps stay close to full teacher forcing
                let x = if *total_steps == 0 {
                    0.0
                } else {
                    10.0 * steps_seen as f64 / *total_steps as f64
                };
                1.0 / (1.0 + (x - 5.0).exp())
            }
        }
    }

    /// True when the policy can never select a sampled token.
    pub fn always_ground_truth(&self) -> bool {
        match self {
            TeacherForcingPolicy::Always => true,
            TeacherForcingPolicy::Ratio(ratio) => *ratio >= 1.0,
            TeacherForcingPolicy::Decay { .. } => false,
        }
    }
}

#[derive(Debug)]
/// # Scheduled sampler
/// Stateful controller pairing a [`TeacherForcingPolicy`] with a monotone step counter
/// and a random source. The random source is generic so tests can inject a
/// deterministic draw sequence.
pub struct ScheduledSampler<R> {
    policy: TeacherForcingPolicy,
    steps_seen: u64,
    rng: R,
}

impl ScheduledSampler<StdRng> {
    pub fn new(policy: TeacherForcingPolicy) -> ScheduledSampler<StdRng> {
        ScheduledSampler::with_rng(policy, StdRng::from_entropy())
    }
}

impl<R> ScheduledSampler<R>
where
    R: Rng,
{
    pub fn with_rng(policy: TeacherForcingPolicy, rng: R) -> ScheduledSampler<R> {
        ScheduledSampler {
            policy,
            steps_seen: 0,
            rng,
        }
    }

    pub fn policy(&self) -> &TeacherForcingPolicy {
        &self.policy
    }

    /// Number of decisions taken so far.
    pub fn steps_seen(&self) -> u64 {
        self.steps_seen
    }

    /// Draws uniformly in \[0, 1) and returns ground truth iff the draw falls below the
    /// current teacher-forcing ratio. Increments the step counter exactly once.
    pub fn next_decision(&mut self) -> FeedDecision {
        let ratio = self.policy.ratio_at(self.steps_seen);
        self.steps_seen += 1;
        if self.rng.gen::<f64>() < ratio {
            FeedDecision::GroundTruth
        } else {
            FeedDecision::ModelPrediction
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_linear_decay_endpoints() {
        let policy = TeacherForcingPolicy::Decay {
            curve: DecayCurve::linear,
            total_steps: 100,
        };
        assert!((policy.ratio_at(0) - 1.0).abs() < 1e-12);
        assert!(policy.ratio_at(100).abs() < 1e-12);
        assert!(policy.ratio_at(250).abs() < 1e-12);

        let mut previous = policy.ratio_at(0);
        for step in 1..=120 {
            let current = policy.ratio_at(step);
            assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn test_inverse_sigmoid_decay() {
        let policy = TeacherForcingPolicy::Decay {
            curve: DecayCurve::inverse_sigmoid,
            total_steps: 100,
        };
        assert!(policy.ratio_at(0) > 0.99);
        assert!((policy.ratio_at(50) - 0.5).abs() < 1e-12);
        assert!(policy.ratio_at(100) < 0.01);

        let zero_total = TeacherForcingPolicy::Decay {
            curve: DecayCurve::inverse_sigmoid,
            total_steps: 0,
        };
        assert!(zero_total.ratio_at(10) > 0.99);
    }

    #[test]
    fn test_ratio_extremes() {
        let mut always = ScheduledSampler::with_rng(
            TeacherForcingPolicy::Ratio(1.0),
            StdRng::seed_from_u64(42),
        );
        let mut never = ScheduledSampler::with_rng(
            TeacherForcingPolicy::Ratio(0.0),
            StdRng::seed_from_u64(42),
        );
        for _ in 0..1000 {
            assert_eq!(always.next_decision(), FeedDecision::GroundTruth);
            assert_eq!(never.next_decision(), FeedDecision::ModelPrediction);
        }
        assert_eq!(always.steps_seen(), 1000);
    }

    #[test]
    fn test_counter_drives_decay() {
        let mut sampler = ScheduledSampler::with_rng(
            TeacherForcingPolicy::Decay {
                curve: DecayCurve::linear,
                total_steps: 10,
            },
            StdRng::seed_from_u64(7),
        );
        for _ in 0..10 {
            sampler.next_decision();
        }
        // fully decayed: every further decision must sample
        for _ in 0..100 {
            assert_eq!(sampler.next_decision(), FeedDecision::ModelPrediction);
        }
    }
}
