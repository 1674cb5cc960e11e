use db::models::research_task::ReportType;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Queries longer than this are treated as complex.
const LONG_QUERY_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct CostEstimate {
    pub report_type: ReportType,
    pub estimated_cost: f64,
    pub estimated_time_minutes: u32,
    pub estimated_queries: u32,
}

/// Rough up-front figures for a research run, before any engine work happens.
pub fn estimate(report_type: ReportType, query: &str) -> CostEstimate {
    let (mut cost, mut minutes, mut queries): (f64, f64, f64) = match report_type {
        ReportType::Deep => (0.40, 8.0, 75.0),
        ReportType::MultiAgent => (0.80, 20.0, 150.0),
        _ => (0.15, 2.0, 10.0),
    };

    if query.chars().count() > LONG_QUERY_CHARS {
        cost *= 1.5;
        minutes *= 1.3;
        queries *= 1.2;
    }

    CostEstimate {
        report_type,
        estimated_cost: (cost * 100.0).round() / 100.0,
        estimated_time_minutes: minutes as u32,
        estimated_queries: queries as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_have_their_own_baselines() {
        let basic = estimate(ReportType::ResearchReport, "short question");
        assert_eq!(basic.estimated_cost, 0.15);
        assert_eq!(basic.estimated_time_minutes, 2);
        assert_eq!(basic.estimated_queries, 10);

        let deep = estimate(ReportType::Deep, "short question");
        assert_eq!(deep.estimated_cost, 0.40);
        assert_eq!(deep.estimated_time_minutes, 8);
        assert_eq!(deep.estimated_queries, 75);

        let multi = estimate(ReportType::MultiAgent, "short question");
        assert_eq!(multi.estimated_cost, 0.80);
        assert_eq!(multi.estimated_time_minutes, 20);
        assert_eq!(multi.estimated_queries, 150);
    }

    #[test]
    fn long_queries_cost_more() {
        let query = "x".repeat(LONG_QUERY_CHARS + 1);
        let deep = estimate(ReportType::Deep, &query);
        assert_eq!(deep.estimated_cost, 0.60);
        assert_eq!(deep.estimated_time_minutes, 10);
        assert_eq!(deep.estimated_queries, 90);

        let at_limit = estimate(ReportType::Deep, &"x".repeat(LONG_QUERY_CHARS));
        assert_eq!(at_limit.estimated_queries, 75);
    }
}
