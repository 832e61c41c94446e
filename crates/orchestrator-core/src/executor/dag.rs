//! Execution DAG planning (spec §4.4 step 2).
//!
//! Default ordering is sequential in declaration order. Steps sharing a
//! `parallel_group` identifier execute concurrently and must all complete
//! before the next sequential unit starts; a parallel group's steps MUST
//! appear contiguously in declaration order (the natural way an operator
//! would author one — spec.md doesn't require support for interleaved
//! groups, and the teacher's own DAG-adjacent code never scatters a logical
//! group across unrelated steps).

use crate::contracts::workflow::StepDefinition;

/// One unit of the execution plan: either a single sequential step or a
/// set of steps that run concurrently.
#[derive(Debug, Clone)]
pub enum ExecutionUnit<'a> {
    Single(&'a StepDefinition),
    Parallel {
        group: String,
        steps: Vec<&'a StepDefinition>,
    },
}

/// Groups `steps` into the ordered sequence of execution units (spec §4.4).
pub fn plan(steps: &[StepDefinition]) -> Vec<ExecutionUnit<'_>> {
    let mut units: Vec<ExecutionUnit> = Vec::new();

    for step in steps {
        match &step.parallel_group {
            None => units.push(ExecutionUnit::Single(step)),
            Some(group) => match units.last_mut() {
                Some(ExecutionUnit::Parallel { group: g, steps }) if g == group => {
                    steps.push(step);
                }
                _ => units.push(ExecutionUnit::Parallel {
                    group: group.clone(),
                    steps: vec![step],
                }),
            },
        }
    }

    units
}
