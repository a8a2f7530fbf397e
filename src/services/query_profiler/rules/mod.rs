//! Optimization rules
//!
//! Rule trait and registry for turning parsed explain plans into
//! recommendations. Rules are organized by plan kind: `plan` for
//! find-shaped winning plans, `pipeline` for aggregation stage lists.

pub mod pipeline;
pub mod plan;

use crate::models::{
    AggregationExplainPlan, ExplainPlan, OptimizationRecommendation, SeverityLevel,
};

// ============================================================================
// Rule Traits and Context
// ============================================================================

/// Tunable thresholds shared by the rules.
#[derive(Debug, Clone)]
pub struct RuleThresholds {
    /// A pattern seen more often than this is reported as hot.
    pub frequent_pattern_threshold: u64,
    /// Efficiency ratios below this are reported as low.
    pub low_efficiency_ratio: f64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self { frequent_pattern_threshold: 10, low_efficiency_ratio: 0.1 }
    }
}

/// Context for evaluating rules against a find-shaped plan.
pub struct PlanRuleContext<'a> {
    pub plan: &'a ExplainPlan,
    /// How many times this query pattern has been recorded so far.
    pub pattern_count: u64,
    pub thresholds: &'a RuleThresholds,
}

impl PlanRuleContext<'_> {
    /// Top-level filter field names from the query shape, `$`-operators
    /// excluded. Used to draft index suggestions.
    pub fn filter_fields(&self) -> Vec<String> {
        match &self.plan.query_shape {
            serde_json::Value::Object(map) => map
                .keys()
                .filter(|key| !key.starts_with('$'))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Deterministic recommendation id for this plan and detector tag.
    pub fn recommendation_id(&self, tag: &str) -> String {
        format!("{}-{}", self.plan.query_id, tag)
    }
}

/// Context for evaluating rules against an aggregation plan.
pub struct PipelineRuleContext<'a> {
    pub plan: &'a AggregationExplainPlan,
    pub thresholds: &'a RuleThresholds,
}

impl PipelineRuleContext<'_> {
    pub fn recommendation_id(&self, tag: &str) -> String {
        format!("{}-{}", self.plan.query_id, tag)
    }
}

/// A rule over find-shaped winning plans.
pub trait PlanRule: Send + Sync {
    /// Stable detector tag, used as the recommendation id suffix.
    fn tag(&self) -> &'static str;

    /// Evaluate the rule, returning a recommendation when triggered.
    fn evaluate(&self, ctx: &PlanRuleContext) -> Option<OptimizationRecommendation>;
}

/// A rule over aggregation stage lists.
pub trait PipelineRule: Send + Sync {
    fn tag(&self) -> &'static str;

    fn evaluate(&self, ctx: &PipelineRuleContext) -> Option<OptimizationRecommendation>;
}

// ============================================================================
// Rule Registry and Evaluation
// ============================================================================

/// All registered find-plan rules.
pub fn get_plan_rules() -> Vec<Box<dyn PlanRule>> {
    plan::get_rules()
}

/// All registered aggregation rules.
pub fn get_pipeline_rules() -> Vec<Box<dyn PipelineRule>> {
    pipeline::get_rules()
}

/// Run every find-plan rule and return recommendations critical-first.
pub fn evaluate_plan(
    plan: &ExplainPlan,
    pattern_count: u64,
    thresholds: &RuleThresholds,
) -> Vec<OptimizationRecommendation> {
    let ctx = PlanRuleContext { plan, pattern_count, thresholds };
    let recommendations = get_plan_rules()
        .iter()
        .filter_map(|rule| rule.evaluate(&ctx))
        .collect();
    sort_by_severity(recommendations)
}

/// Run every aggregation rule and return recommendations critical-first.
pub fn evaluate_pipeline(
    plan: &AggregationExplainPlan,
    thresholds: &RuleThresholds,
) -> Vec<OptimizationRecommendation> {
    let ctx = PipelineRuleContext { plan, thresholds };
    let recommendations = get_pipeline_rules()
        .iter()
        .filter_map(|rule| rule.evaluate(&ctx))
        .collect();
    sort_by_severity(recommendations)
}

/// Severity-descending sort. The sort is stable, so rules that share a
/// severity keep their registration order.
fn sort_by_severity(
    mut recommendations: Vec<OptimizationRecommendation>,
) -> Vec<OptimizationRecommendation> {
    recommendations.sort_by(|a, b| b.severity.cmp(&a.severity));
    recommendations
}

/// Severity of the worst recommendation, if any triggered.
pub fn max_severity(recommendations: &[OptimizationRecommendation]) -> Option<SeverityLevel> {
    recommendations.iter().map(|r| r.severity).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, severity: SeverityLevel) -> OptimizationRecommendation {
        OptimizationRecommendation {
            id: id.to_string(),
            title: String::new(),
            description: String::new(),
            severity,
            category: "query".to_string(),
            suggested_action: String::new(),
            estimated_improvement: String::new(),
            code_example: None,
            documentation_link: None,
        }
    }

    #[test]
    fn test_sort_critical_first_and_stable() {
        let sorted = sort_by_severity(vec![
            rec("a", SeverityLevel::Info),
            rec("b", SeverityLevel::Critical),
            rec("c", SeverityLevel::Warning),
            rec("d", SeverityLevel::Info),
        ]);
        let ids: Vec<&str> = sorted.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["b", "c", "a", "d"]);
    }

    #[test]
    fn test_max_severity() {
        assert_eq!(max_severity(&[]), None);
        let recs = vec![rec("a", SeverityLevel::Info), rec("b", SeverityLevel::Warning)];
        assert_eq!(max_severity(&recs), Some(SeverityLevel::Warning));
    }

    #[test]
    fn test_registries_are_populated() {
        assert_eq!(get_plan_rules().len(), 5);
        assert_eq!(get_pipeline_rules().len(), 4);
    }
}
