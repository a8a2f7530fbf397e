//! Aggregation pipeline rules
//!
//! Detect pipeline-shaped pathologies: unindexed `$lookup` joins, sorts
//! spilling to disk, `$unwind` fan-out, and filters placed too late.

use super::{PipelineRule, PipelineRuleContext};
use crate::models::{OptimizationRecommendation, SeverityLevel};

/// All aggregation rules, in registration order.
pub fn get_rules() -> Vec<Box<dyn PipelineRule>> {
    vec![
        Box::new(UnindexedLookupRule),
        Box::new(DiskSortRule),
        Box::new(UnwindFanOutRule),
        Box::new(LateMatchRule),
    ]
}

// ============================================================================
// $lookup without index
// ============================================================================

/// A `$lookup` executed as a nested loop join.
pub struct UnindexedLookupRule;

impl PipelineRule for UnindexedLookupRule {
    fn tag(&self) -> &'static str {
        "lookup-nested-loop"
    }

    fn evaluate(&self, ctx: &PipelineRuleContext) -> Option<OptimizationRecommendation> {
        let lookup = ctx
            .plan
            .stages
            .iter()
            .find(|s| {
                s.stage_name == "$lookup" && s.lookup_strategy.as_deref() == Some("nestedLoopJoin")
            })?;
        let foreign = lookup.lookup_collection.as_deref().unwrap_or("the foreign collection");

        Some(OptimizationRecommendation {
            id: ctx.recommendation_id(self.tag()),
            title: "$lookup runs as a nested loop join".to_string(),
            description: format!(
                "The $lookup against '{}' has no usable index on its foreign field, so every \
                 input document triggers a full scan of '{}'.",
                foreign, foreign
            ),
            severity: SeverityLevel::Critical,
            category: "index".to_string(),
            suggested_action: format!(
                "Create an index on the foreignField of '{}' so the join becomes an indexed \
                 loop join.",
                foreign
            ),
            estimated_improvement: "Join cost drops from O(n*m) to O(n log m)".to_string(),
            code_example: lookup
                .lookup_collection
                .as_ref()
                .map(|coll| format!("db.{}.createIndex({{ \"<foreignField>\": 1 }})", coll)),
            documentation_link: Some(
                "https://www.mongodb.com/docs/manual/reference/operator/aggregation/lookup/"
                    .to_string(),
            ),
        })
    }
}

// ============================================================================
// $sort spilling to disk
// ============================================================================

/// A `$sort` stage that exceeded its memory limit and spilled.
pub struct DiskSortRule;

impl PipelineRule for DiskSortRule {
    fn tag(&self) -> &'static str {
        "disk-sort"
    }

    fn evaluate(&self, ctx: &PipelineRuleContext) -> Option<OptimizationRecommendation> {
        ctx.plan
            .stages
            .iter()
            .find(|s| s.stage_name == "$sort" && s.uses_disk)?;

        Some(OptimizationRecommendation {
            id: ctx.recommendation_id(self.tag()),
            title: "$sort spills to disk".to_string(),
            description: "The $sort stage exceeded its memory limit and wrote intermediate \
                          results to disk, which is orders of magnitude slower."
                .to_string(),
            severity: SeverityLevel::Warning,
            category: "query".to_string(),
            suggested_action: "Move the $sort earlier so an index can serve it, or reduce the \
                               sorted data with $match and $project before sorting."
                .to_string(),
            estimated_improvement: "Keeps the sort in memory".to_string(),
            code_example: None,
            documentation_link: Some(
                "https://www.mongodb.com/docs/manual/reference/operator/aggregation/sort/"
                    .to_string(),
            ),
        })
    }
}

// ============================================================================
// $unwind fan-out
// ============================================================================

/// `$unwind` multiplies the working set by array length.
pub struct UnwindFanOutRule;

impl PipelineRule for UnwindFanOutRule {
    fn tag(&self) -> &'static str {
        "unwind"
    }

    fn evaluate(&self, ctx: &PipelineRuleContext) -> Option<OptimizationRecommendation> {
        ctx.plan.stages.iter().find(|s| s.stage_name == "$unwind")?;

        Some(OptimizationRecommendation {
            id: ctx.recommendation_id(self.tag()),
            title: "$unwind multiplies documents".to_string(),
            description: "Each $unwind emits one document per array element, growing the \
                          working set for every later stage."
                .to_string(),
            severity: SeverityLevel::Info,
            category: "query".to_string(),
            suggested_action: "Filter before unwinding, or restructure with $filter/$map to \
                               operate on the array in place."
                .to_string(),
            estimated_improvement: "Downstream stages process fewer documents".to_string(),
            code_example: None,
            documentation_link: Some(
                "https://www.mongodb.com/docs/manual/reference/operator/aggregation/unwind/"
                    .to_string(),
            ),
        })
    }
}

// ============================================================================
// Late $match
// ============================================================================

/// A `$match` placed after stages that could have run on less data.
pub struct LateMatchRule;

impl PipelineRule for LateMatchRule {
    fn tag(&self) -> &'static str {
        "late-match"
    }

    fn evaluate(&self, ctx: &PipelineRuleContext) -> Option<OptimizationRecommendation> {
        let first_match = ctx
            .plan
            .stages
            .iter()
            .position(|s| s.stage_name == "$match")?;
        // $cursor is the pushed-down prefix the server already optimized;
        // a $match directly after it is effectively leading.
        let preceded_by_work = ctx.plan.stages[..first_match]
            .iter()
            .any(|s| s.stage_name != "$cursor");
        if !preceded_by_work {
            return None;
        }

        Some(OptimizationRecommendation {
            id: ctx.recommendation_id(self.tag()),
            title: "$match runs late in the pipeline".to_string(),
            description: format!(
                "The first $match appears at stage {} of {}. Every stage before it processed \
                 documents that were then discarded.",
                first_match + 1,
                ctx.plan.stages.len()
            ),
            severity: SeverityLevel::Warning,
            category: "query".to_string(),
            suggested_action: "Move the $match to the front of the pipeline so it can use \
                               indexes and shrink the working set early."
                .to_string(),
            estimated_improvement: "Earlier stages process only matching documents".to_string(),
            code_example: None,
            documentation_link: Some(
                "https://www.mongodb.com/docs/manual/core/aggregation-pipeline-optimization/"
                    .to_string(),
            ),
        })
    }
}
