//! Find-plan rules
//!
//! Detect the classic single-query pathologies: full collection scans,
//! low read efficiency, in-memory sorts, near-covered queries, and hot
//! query patterns.

use super::{PlanRule, PlanRuleContext};
use crate::models::{OptimizationRecommendation, QueryStage, SeverityLevel};

/// All find-plan rules, in registration order.
pub fn get_rules() -> Vec<Box<dyn PlanRule>> {
    vec![
        Box::new(CollectionScanRule),
        Box::new(LowEfficiencyRule),
        Box::new(InMemorySortRule),
        Box::new(CoveredQueryOpportunityRule),
        Box::new(FrequentPatternRule),
    ]
}

// ============================================================================
// COLLSCAN
// ============================================================================

/// The winning plan scans the whole collection.
pub struct CollectionScanRule;

impl PlanRule for CollectionScanRule {
    fn tag(&self) -> &'static str {
        "collscan"
    }

    fn evaluate(&self, ctx: &PlanRuleContext) -> Option<OptimizationRecommendation> {
        if !ctx.plan.winning_plan.any_stage(QueryStage::Collscan) {
            return None;
        }

        // Suggest at most the first three filter fields as index keys.
        let fields: Vec<String> = ctx.filter_fields().into_iter().take(3).collect();
        let code_example = if fields.is_empty() {
            None
        } else {
            let keys = fields
                .iter()
                .map(|f| format!("\"{}\": 1", f))
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!("db.{}.createIndex({{ {} }})", ctx.plan.collection, keys))
        };

        Some(OptimizationRecommendation {
            id: ctx.recommendation_id(self.tag()),
            title: "Full collection scan".to_string(),
            description: format!(
                "Queries on '{}' matching this shape scan every document because no index \
                 supports the filter.",
                ctx.plan.collection
            ),
            severity: SeverityLevel::Critical,
            category: "index".to_string(),
            suggested_action: if fields.is_empty() {
                "Create an index on the fields this query filters by.".to_string()
            } else {
                format!("Create an index covering the filter fields: {}.", fields.join(", "))
            },
            estimated_improvement: "Scan time drops from O(collection size) to O(matches)"
                .to_string(),
            code_example,
            documentation_link: Some(
                "https://www.mongodb.com/docs/manual/core/indexes/".to_string(),
            ),
        })
    }
}

// ============================================================================
// Low Efficiency
// ============================================================================

/// Many documents examined per document returned.
pub struct LowEfficiencyRule;

impl PlanRule for LowEfficiencyRule {
    fn tag(&self) -> &'static str {
        "low-efficiency"
    }

    fn evaluate(&self, ctx: &PlanRuleContext) -> Option<OptimizationRecommendation> {
        let stats = ctx.plan.stats.as_ref()?;
        let ratio = stats.efficiency_ratio();
        if ratio >= ctx.thresholds.low_efficiency_ratio {
            return None;
        }

        Some(OptimizationRecommendation {
            id: ctx.recommendation_id(self.tag()),
            title: "Low query efficiency".to_string(),
            description: format!(
                "Only {:.1}% of examined documents were returned ({} examined, {} returned). \
                 The current index is a poor fit for this filter.",
                ratio * 100.0,
                stats.docs_examined,
                stats.docs_returned
            ),
            severity: SeverityLevel::Warning,
            category: "index".to_string(),
            suggested_action:
                "Add a compound index whose key order matches the query's equality and range \
                 predicates."
                    .to_string(),
            estimated_improvement: format!(
                "Up to {:.0}x fewer documents examined",
                (1.0 / ratio.max(f64::EPSILON)).min(1000.0)
            ),
            code_example: None,
            documentation_link: Some(
                "https://www.mongodb.com/docs/manual/core/query-optimization/".to_string(),
            ),
        })
    }
}

// ============================================================================
// In-Memory Sort
// ============================================================================

/// The plan contains a blocking SORT stage.
pub struct InMemorySortRule;

impl PlanRule for InMemorySortRule {
    fn tag(&self) -> &'static str {
        "sort-stage"
    }

    fn evaluate(&self, ctx: &PlanRuleContext) -> Option<OptimizationRecommendation> {
        if !ctx.plan.winning_plan.any_stage(QueryStage::Sort) {
            return None;
        }

        Some(OptimizationRecommendation {
            id: ctx.recommendation_id(self.tag()),
            title: "In-memory sort".to_string(),
            description: "The server sorts results in memory because no index provides the \
                          requested order. Large result sets will hit the sort memory limit."
                .to_string(),
            severity: SeverityLevel::Warning,
            category: "index".to_string(),
            suggested_action: "Extend the index with the sort keys, in sort order, so results \
                               stream back pre-sorted."
                .to_string(),
            estimated_improvement: "Removes the blocking sort stage entirely".to_string(),
            code_example: None,
            documentation_link: Some(
                "https://www.mongodb.com/docs/manual/tutorial/sort-results-with-indexes/"
                    .to_string(),
            ),
        })
    }
}

// ============================================================================
// Covered Query Opportunity
// ============================================================================

/// An index already serves the filter but documents are still fetched.
pub struct CoveredQueryOpportunityRule;

impl PlanRule for CoveredQueryOpportunityRule {
    fn tag(&self) -> &'static str {
        "covered-query"
    }

    fn evaluate(&self, ctx: &PlanRuleContext) -> Option<OptimizationRecommendation> {
        let stats = ctx.plan.stats.as_ref()?;
        if stats.is_covered_query {
            return None;
        }
        let index = stats.index_used.as_deref()?;

        Some(OptimizationRecommendation {
            id: ctx.recommendation_id(self.tag()),
            title: "Query could be covered".to_string(),
            description: format!(
                "The query already uses index '{}' but still fetches full documents. If the \
                 projection only needs indexed fields, the fetch can be skipped.",
                index
            ),
            severity: SeverityLevel::Info,
            category: "query".to_string(),
            suggested_action: "Project only indexed fields (and exclude _id unless it is in \
                               the index) to let the index answer the query alone."
                .to_string(),
            estimated_improvement: "Eliminates one document fetch per result".to_string(),
            code_example: None,
            documentation_link: Some(
                "https://www.mongodb.com/docs/manual/core/query-optimization/#covered-query"
                    .to_string(),
            ),
        })
    }
}

// ============================================================================
// Frequent Pattern
// ============================================================================

/// The same slow pattern keeps recurring.
pub struct FrequentPatternRule;

impl PlanRule for FrequentPatternRule {
    fn tag(&self) -> &'static str {
        "frequent-pattern"
    }

    fn evaluate(&self, ctx: &PlanRuleContext) -> Option<OptimizationRecommendation> {
        if ctx.pattern_count <= ctx.thresholds.frequent_pattern_threshold {
            return None;
        }

        Some(OptimizationRecommendation {
            id: ctx.recommendation_id(self.tag()),
            title: "Frequent slow pattern".to_string(),
            description: format!(
                "This query pattern has been recorded {} times. Fixing it pays off across \
                 every occurrence, consider caching if the data tolerates staleness.",
                ctx.pattern_count
            ),
            severity: SeverityLevel::Info,
            category: "query".to_string(),
            suggested_action: "Prioritize this pattern for optimization or add an application \
                               level cache in front of it."
                .to_string(),
            estimated_improvement: format!(
                "Improvement multiplies across {} recorded occurrences",
                ctx.pattern_count
            ),
            code_example: None,
            documentation_link: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExplainPlan, ExplainStage, QueryStats};
    use crate::services::query_profiler::rules::RuleThresholds;
    use chrono::Utc;
    use serde_json::json;

    fn plan_with(winning: ExplainStage, stats: Option<QueryStats>) -> ExplainPlan {
        ExplainPlan {
            query_id: "deadbeefdeadbeef".to_string(),
            collection: "users".to_string(),
            query_shape: json!({ "status": "<value>", "age": { "$gt": "<value>" } }),
            winning_plan: winning,
            rejected_plans: vec![],
            stats,
            server_info: json!({}),
            timestamp: Utc::now(),
        }
    }

    fn stage(stage: QueryStage, name: &str) -> ExplainStage {
        ExplainStage { stage, stage_name: name.to_string(), ..Default::default() }
    }

    fn ctx<'a>(
        plan: &'a ExplainPlan,
        pattern_count: u64,
        thresholds: &'a RuleThresholds,
    ) -> PlanRuleContext<'a> {
        PlanRuleContext { plan, pattern_count, thresholds }
    }

    #[test]
    fn test_collscan_triggers_with_index_example() {
        let plan = plan_with(stage(QueryStage::Collscan, "COLLSCAN"), None);
        let thresholds = RuleThresholds::default();
        let rec = CollectionScanRule.evaluate(&ctx(&plan, 1, &thresholds)).expect("triggered");
        assert_eq!(rec.severity, SeverityLevel::Critical);
        assert_eq!(rec.id, "deadbeefdeadbeef-collscan");
        let example = rec.code_example.expect("example");
        assert!(example.contains("db.users.createIndex"));
        assert!(example.contains("\"status\": 1"));
    }

    #[test]
    fn test_collscan_index_example_caps_at_three_fields() {
        let mut plan = plan_with(stage(QueryStage::Collscan, "COLLSCAN"), None);
        plan.query_shape = json!({
            "a": "<value>", "b": "<value>", "c": "<value>", "d": "<value>",
        });
        let thresholds = RuleThresholds::default();
        let rec = CollectionScanRule.evaluate(&ctx(&plan, 1, &thresholds)).expect("triggered");
        let example = rec.code_example.expect("example");
        assert!(example.contains("\"a\": 1"));
        assert!(example.contains("\"c\": 1"));
        assert!(!example.contains("\"d\""));
        assert!(rec.suggested_action.ends_with("a, b, c."));
    }

    #[test]
    fn test_collscan_silent_on_ixscan() {
        let plan = plan_with(stage(QueryStage::Ixscan, "IXSCAN"), None);
        let thresholds = RuleThresholds::default();
        assert!(CollectionScanRule.evaluate(&ctx(&plan, 1, &thresholds)).is_none());
    }

    #[test]
    fn test_low_efficiency_threshold() {
        let thresholds = RuleThresholds::default();
        let slow = plan_with(
            stage(QueryStage::Fetch, "FETCH"),
            Some(QueryStats { docs_examined: 1000, docs_returned: 50, ..Default::default() }),
        );
        let rec = LowEfficiencyRule.evaluate(&ctx(&slow, 1, &thresholds)).expect("triggered");
        assert_eq!(rec.severity, SeverityLevel::Warning);

        let fine = plan_with(
            stage(QueryStage::Fetch, "FETCH"),
            Some(QueryStats { docs_examined: 1000, docs_returned: 500, ..Default::default() }),
        );
        assert!(LowEfficiencyRule.evaluate(&ctx(&fine, 1, &thresholds)).is_none());
    }

    #[test]
    fn test_low_efficiency_ignores_zero_examined() {
        let thresholds = RuleThresholds::default();
        let plan = plan_with(
            stage(QueryStage::Ixscan, "IXSCAN"),
            Some(QueryStats { docs_examined: 0, docs_returned: 0, ..Default::default() }),
        );
        assert!(LowEfficiencyRule.evaluate(&ctx(&plan, 1, &thresholds)).is_none());
    }

    #[test]
    fn test_sort_stage_detected_in_predecessors() {
        let thresholds = RuleThresholds::default();
        let mut root = stage(QueryStage::Limit, "LIMIT");
        root.predecessors.push(stage(QueryStage::Sort, "SORT"));
        let plan = plan_with(root, None);
        let rec = InMemorySortRule.evaluate(&ctx(&plan, 1, &thresholds)).expect("triggered");
        assert_eq!(rec.id, "deadbeefdeadbeef-sort-stage");
    }

    #[test]
    fn test_covered_opportunity_requires_index() {
        let thresholds = RuleThresholds::default();
        let with_index = plan_with(
            stage(QueryStage::Fetch, "FETCH"),
            Some(QueryStats {
                docs_examined: 10,
                docs_returned: 10,
                index_used: Some("status_1".to_string()),
                ..Default::default()
            }),
        );
        let rec = CoveredQueryOpportunityRule
            .evaluate(&ctx(&with_index, 1, &thresholds))
            .expect("triggered");
        assert_eq!(rec.severity, SeverityLevel::Info);

        let no_index = plan_with(
            stage(QueryStage::Collscan, "COLLSCAN"),
            Some(QueryStats { docs_examined: 10, docs_returned: 10, ..Default::default() }),
        );
        assert!(CoveredQueryOpportunityRule.evaluate(&ctx(&no_index, 1, &thresholds)).is_none());
    }

    #[test]
    fn test_covered_opportunity_silent_when_already_covered() {
        let thresholds = RuleThresholds::default();
        let plan = plan_with(
            stage(QueryStage::Projection, "PROJECTION_COVERED"),
            Some(QueryStats {
                docs_examined: 0,
                docs_returned: 10,
                keys_examined: 10,
                index_used: Some("status_1".to_string()),
                is_covered_query: true,
                ..Default::default()
            }),
        );
        assert!(CoveredQueryOpportunityRule.evaluate(&ctx(&plan, 1, &thresholds)).is_none());
    }

    #[test]
    fn test_frequent_pattern_strictly_above_threshold() {
        let thresholds = RuleThresholds::default();
        let plan = plan_with(stage(QueryStage::Ixscan, "IXSCAN"), None);
        assert!(FrequentPatternRule.evaluate(&ctx(&plan, 10, &thresholds)).is_none());
        let rec = FrequentPatternRule.evaluate(&ctx(&plan, 11, &thresholds)).expect("triggered");
        assert!(rec.description.contains("11 times"));
    }
}
