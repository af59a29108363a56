//! Hybrid pattern scoring.
//!
//! Merges keyword overlap, semantic similarity, quality, and historical
//! success into one score with adaptive weighting. Pure computation: no I/O,
//! no shared state, deterministic for identical inputs. The only per-call
//! allocations are the two case-folded keyword sets.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use event_schema::payloads::{ScoreWeights, TaskCharacteristics, TaskComplexity};

/// A scoring dimension, used for domain preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Keyword,
    Semantic,
    Quality,
    SuccessRate,
}

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub default_weights: ScoreWeights,
    /// Per-dimension clamp bounds applied after adaptive shifts
    pub weight_min: f64,
    pub weight_max: f64,
    /// Enables complexity/domain weight shifts
    pub adaptive: bool,
    /// Group shift applied for high/low complexity, in weight points
    pub complexity_shift: f64,
    /// Nudge applied toward a domain's favored dimension, in weight points
    pub domain_shift: f64,
    /// Domains with a known favored dimension
    pub domain_preferences: HashMap<String, Dimension>,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        let mut domain_preferences = HashMap::new();
        domain_preferences.insert("api".to_string(), Dimension::Keyword);
        domain_preferences.insert("data".to_string(), Dimension::Quality);
        domain_preferences.insert("ml".to_string(), Dimension::Semantic);
        domain_preferences.insert("infrastructure".to_string(), Dimension::SuccessRate);

        Self {
            default_weights: ScoreWeights {
                keyword: 0.25,
                semantic: 0.35,
                quality: 0.20,
                success_rate: 0.20,
            },
            weight_min: 0.10,
            weight_max: 0.80,
            adaptive: true,
            complexity_shift: 0.10,
            domain_shift: 0.10,
            domain_preferences,
        }
    }
}

/// Scorer inputs. Missing dimensional scores default to 0.5; the semantic
/// dimension falls back to a supplied confidence score before the default.
#[derive(Debug, Clone, Default)]
pub struct ScoreInputs<'a> {
    pub pattern_keywords: &'a [String],
    pub context_keywords: &'a [String],
    pub quality_score: Option<f64>,
    pub success_rate: Option<f64>,
    pub semantic_score: Option<f64>,
    pub confidence_score: Option<f64>,
    pub weights: Option<ScoreWeights>,
    pub task: Option<&'a TaskCharacteristics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub keyword: f64,
    pub semantic: f64,
    pub quality: f64,
    pub success_rate: f64,
}

/// Scoring outcome. `raw_weights` are post-shift pre-clamp, `weights_used`
/// are the normalized weights the score was computed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridScore {
    pub hybrid_score: f64,
    pub confidence: f64,
    pub breakdown: ScoreBreakdown,
    pub weights_used: ScoreWeights,
    pub raw_weights: ScoreWeights,
    /// Relevance gate factor applied to score and confidence
    pub relevance: f64,
}

#[derive(Debug, Clone, Default)]
pub struct HybridScorer {
    config: ScorerConfig,
}

impl HybridScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, inputs: &ScoreInputs<'_>) -> HybridScore {
        let keyword = jaccard_keywords(inputs.pattern_keywords, inputs.context_keywords);
        let semantic = inputs
            .semantic_score
            .or(inputs.confidence_score)
            .unwrap_or(0.5);
        let quality = inputs.quality_score.unwrap_or(0.5);
        let success_rate = inputs.success_rate.unwrap_or(0.5);

        let raw_weights = self.shifted_weights(inputs.weights, inputs.task);
        let weights_used = normalize_with_bounds(
            raw_weights,
            self.config.weight_min,
            self.config.weight_max,
        );

        let weighted_sum = weights_used.keyword * keyword
            + weights_used.semantic * semantic
            + weights_used.quality * quality
            + weights_used.success_rate * success_rate;

        // A pattern with no keyword overlap and weak semantic similarity is
        // irrelevant to the task no matter how good it is intrinsically.
        let relevance = (2.0 * keyword.max(semantic)).min(1.0);

        let dimensions = [keyword, semantic, quality, success_rate];
        let mean = dimensions.iter().sum::<f64>() / dimensions.len() as f64;
        let variance = dimensions
            .iter()
            .map(|d| (d - mean).powi(2))
            .sum::<f64>()
            / dimensions.len() as f64;

        let hybrid_score = (weighted_sum * relevance).clamp(0.0, 1.0);
        let confidence = (mean * (1.0 - variance.min(1.0)) * relevance).clamp(0.0, 1.0);

        HybridScore {
            hybrid_score,
            confidence,
            breakdown: ScoreBreakdown {
                keyword,
                semantic,
                quality,
                success_rate,
            },
            weights_used,
            raw_weights,
            relevance,
        }
    }

    fn shifted_weights(
        &self,
        supplied: Option<ScoreWeights>,
        task: Option<&TaskCharacteristics>,
    ) -> ScoreWeights {
        let mut weights = supplied.unwrap_or(self.config.default_weights);

        let Some(task) = task.filter(|_| self.config.adaptive) else {
            return weights;
        };

        // Complexity shifts weight between the pattern-matching group
        // (semantic + keyword) and the track-record group (quality + success).
        let half = self.config.complexity_shift / 2.0;
        match task.complexity {
            Some(TaskComplexity::High) => {
                weights.keyword += half;
                weights.semantic += half;
                weights.quality -= half;
                weights.success_rate -= half;
            }
            Some(TaskComplexity::Low) => {
                weights.keyword -= half;
                weights.semantic -= half;
                weights.quality += half;
                weights.success_rate += half;
            }
            Some(TaskComplexity::Medium) | None => {}
        }

        if let Some(favored) = task
            .domain
            .as_deref()
            .map(str::to_ascii_lowercase)
            .and_then(|d| self.config.domain_preferences.get(&d).copied())
        {
            let nudge = self.config.domain_shift;
            let spread = nudge / 3.0;
            for dimension in [
                Dimension::Keyword,
                Dimension::Semantic,
                Dimension::Quality,
                Dimension::SuccessRate,
            ] {
                let slot = match dimension {
                    Dimension::Keyword => &mut weights.keyword,
                    Dimension::Semantic => &mut weights.semantic,
                    Dimension::Quality => &mut weights.quality,
                    Dimension::SuccessRate => &mut weights.success_rate,
                };
                if dimension == favored {
                    *slot += nudge;
                } else {
                    *slot -= spread;
                }
            }
        }

        // Shifts may push a weight slightly negative before clamping
        weights.keyword = weights.keyword.max(0.0);
        weights.semantic = weights.semantic.max(0.0);
        weights.quality = weights.quality.max(0.0);
        weights.success_rate = weights.success_rate.max(0.0);
        weights
    }
}

/// Jaccard similarity over case-folded keyword sets; empty union yields 0.
pub fn jaccard_keywords(pattern: &[String], context: &[String]) -> f64 {
    if pattern.is_empty() && context.is_empty() {
        return 0.0;
    }

    let pattern_set: HashSet<String> =
        pattern.iter().map(|k| k.trim().to_lowercase()).collect();
    let context_set: HashSet<String> =
        context.iter().map(|k| k.trim().to_lowercase()).collect();

    let intersection = pattern_set.intersection(&context_set).count();
    let union = pattern_set.union(&context_set).count();

    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Project weights onto the simplex intersected with per-dimension bounds:
/// the result sums to 1 and every weight lies within `[lo, hi]`.
///
/// Iterative water-filling: saturated weights get pinned at their bound and
/// the remainder is rescaled across the free ones. Terminates in at most
/// four rounds (one per dimension). Falls back to equal weights when the
/// inputs are degenerate (all zero).
fn normalize_with_bounds(weights: ScoreWeights, lo: f64, hi: f64) -> ScoreWeights {
    let mut values = [
        weights.keyword,
        weights.semantic,
        weights.quality,
        weights.success_rate,
    ];

    let sum: f64 = values.iter().sum();
    if sum <= f64::EPSILON {
        values = [0.25; 4];
    }

    let mut pinned = [false; 4];
    for _ in 0..=values.len() {
        let mut pinned_sum = 0.0;
        let mut free_sum = 0.0;
        let mut free_count = 0usize;
        for i in 0..values.len() {
            if pinned[i] {
                pinned_sum += values[i];
            } else {
                free_sum += values[i];
                free_count += 1;
            }
        }
        if free_count == 0 {
            break;
        }

        let target = 1.0 - pinned_sum;
        let scaled: Vec<(usize, f64)> = (0..values.len())
            .filter(|&i| !pinned[i])
            .map(|i| {
                let s = if free_sum <= f64::EPSILON {
                    target / free_count as f64
                } else {
                    values[i] * target / free_sum
                };
                (i, s)
            })
            .collect();

        // Pin one violation class per round: raise the starved dimensions to
        // the floor first, then cap the dominant ones, rescaling between.
        let lows: Vec<usize> = scaled
            .iter()
            .filter(|(_, s)| *s < lo - 1e-12)
            .map(|(i, _)| *i)
            .collect();
        if !lows.is_empty() {
            for i in lows {
                values[i] = lo;
                pinned[i] = true;
            }
            continue;
        }

        let highs: Vec<usize> = scaled
            .iter()
            .filter(|(_, s)| *s > hi + 1e-12)
            .map(|(i, _)| *i)
            .collect();
        if !highs.is_empty() {
            for i in highs {
                values[i] = hi;
                pinned[i] = true;
            }
            continue;
        }

        for (i, s) in scaled {
            values[i] = s;
        }
        break;
    }

    let sum: f64 = values.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        // Degenerate bounds; equal weights always satisfy [0.10, 0.80]
        values = [0.25; 4];
    }

    ScoreWeights {
        keyword: values[0],
        semantic: values[1],
        quality: values[2],
        success_rate: values[3],
    }
}
