//! Cron ticker: grounded on the teacher's `tasks.rs` background-task
//! shape (`tokio::time::interval` loop, tick then a fallible async step,
//! errors logged and swallowed rather than crashing the loop), adapted
//! from "poll Redis for due timers" to "check every cron trigger's
//! schedule against the current minute."

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use tokio::time::interval;
use tracing::{error, info};

use flowcore_core::compile::CompiledTrigger;
use flowcore_core::exec::{self, CapturingSink};
use flowcore_workflow::context::{DeadlineCtx, TriggerData};
use flowcore_workflow::value::Value;

use crate::loader::LoadedWorkflow;
use crate::logger::TracingLogger;
use crate::request::new_request_id;
use crate::state::AppState;

/// Runs forever, checking once a minute whether any loaded workflow's
/// cron trigger is due. One wakeful tick per minute is enough precision
/// for a five-field cron schedule.
pub async fn start_cron_ticker(state: AppState, workflows: Vec<Arc<LoadedWorkflow>>) {
    let mut ticker = interval(Duration::from_secs(60));

    loop {
        ticker.tick().await;
        let now = Utc::now();

        for workflow in &workflows {
            for trigger in &workflow.compiled.triggers {
                let CompiledTrigger::Cron(cron_trigger) = trigger else {
                    continue;
                };
                let schedule = exec::cron_schedule_text(cron_trigger);
                if !matches_now(schedule, now) {
                    continue;
                }

                let state = state.clone();
                let workflow = workflow.clone();
                tokio::spawn(async move {
                    if let Err(e) = fire(&state, &workflow, now).await {
                        error!(workflow = %workflow.config.name, error = %e, "cron-triggered execution failed");
                    }
                });
            }
        }
    }
}

async fn fire(state: &AppState, workflow: &LoadedWorkflow, now: chrono::DateTime<Utc>) -> Result<(), String> {
    let request_id = new_request_id();
    let cron_schedule = workflow
        .compiled
        .triggers
        .iter()
        .find_map(|t| match t {
            CompiledTrigger::Cron(c) => Some(c.schedule.clone()),
            _ => None,
        })
        .unwrap_or_default();

    info!(workflow = %workflow.config.name, schedule = %cron_schedule, "cron trigger fired");

    let trigger_data = TriggerData::Cron {
        schedule_time: now,
        cron: cron_schedule,
    };

    let timeout_sec = if workflow.compiled.timeout_sec > 0 {
        workflow.compiled.timeout_sec
    } else {
        state.config.default_timeout_sec
    };
    let deadline = DeadlineCtx::new(Some(Duration::from_secs(timeout_sec)));
    let logger = Arc::new(TracingLogger::new(request_id.clone(), workflow.config.name.clone()));

    let mut sink = CapturingSink::default();
    let result = exec::execute(
        deadline,
        &workflow.compiled,
        trigger_data,
        request_id,
        &mut sink,
        BTreeMap::<String, Value>::new(),
        &state.collab,
        logger,
    )
    .await;

    if let Some(error) = result.error {
        return Err(error.to_string());
    }
    Ok(())
}

/// A minimal five-field (`min hour dom month dow`) cron matcher:
/// `*`, a literal number, a comma-separated list, and `*/N` steps.
/// Anything else (ranges, named months/days) fails closed — the
/// validator already warns on schedules it can't fully interpret.
fn matches_now(schedule: &str, now: chrono::DateTime<Utc>) -> bool {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    let [minute, hour, dom, month, dow] = [fields[0], fields[1], fields[2], fields[3], fields[4]];

    field_matches(minute, now.minute())
        && field_matches(hour, now.hour())
        && field_matches(dom, now.day())
        && field_matches(month, now.month())
        && field_matches(dow, now.weekday().num_days_from_sunday())
}

fn field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return step.parse::<u32>().map(|n| n != 0 && value % n == 0).unwrap_or(false);
    }
    field.split(',').any(|part| part.trim().parse::<u32>() == Ok(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_minute_always_matches() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 13, 45, 0).unwrap();
        assert!(matches_now("* * * * *", now));
    }

    #[test]
    fn step_field_matches_multiples() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 13, 30, 0).unwrap();
        assert!(matches_now("*/15 * * * *", now));
        let off = Utc.with_ymd_and_hms(2026, 7, 27, 13, 31, 0).unwrap();
        assert!(!matches_now("*/15 * * * *", off));
    }

    #[test]
    fn exact_fields_must_all_match() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 9, 0, 0).unwrap();
        assert!(matches_now("0 9 * * *", now));
        assert!(!matches_now("0 10 * * *", now));
    }

    #[test]
    fn malformed_schedule_never_matches() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 9, 0, 0).unwrap();
        assert!(!matches_now("not a cron schedule", now));
    }
}
