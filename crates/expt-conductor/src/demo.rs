//! Demo executors for the command line
//!
//! A sample holder hands one sample at a time to acquisition steps, which
//! observe a spectrum that processing steps read.

use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use expt_conductor::{
    Completeness, Evaluation, ExecutionContext, Executor, ExecutorRegistry, Instruction, PlanningContext, Procedure,
};

/// Sample offered by a holder
#[derive(Debug, Clone)]
pub(crate) struct Sample {
    pub(crate) holder: String,
}

/// Spectrum observed by an acquisition
#[derive(Debug, Clone)]
pub(crate) struct Spectrum {
    pub(crate) counts: Vec<u64>,
}

pub(crate) struct SampleHolder;

impl Executor for SampleHolder {
    fn plan(&self, context: &mut PlanningContext<'_>) {
        let evaluation = context.declare_variable::<Evaluation>("evaluation").unwrap_or_default();
        context.prepares_condition::<Sample>(evaluation);
    }

    fn execute(&self, context: &ExecutionContext) -> anyhow::Result<()> {
        let holder = context.path().to_string();
        tracing::info!("sample loaded");
        context.prepare_condition(move || Sample { holder: holder.clone() })?;
        tracing::info!("sample unloaded");
        Ok(())
    }
}

pub(crate) struct Acquisition;

impl Executor for Acquisition {
    fn plan(&self, context: &mut PlanningContext<'_>) {
        context.declare_variable::<u64>("frames");
        context.declare_condition_requirement::<Sample>();
        context.observes_result::<Spectrum>();
    }

    fn execute(&self, context: &ExecutionContext) -> anyhow::Result<()> {
        let frames: u64 = context.variable("frames").unwrap_or(5);
        let sample = context.acquire_condition::<Sample>()?;
        let holder = sample.value()?.holder.clone();
        tracing::info!(%holder, frames, "acquiring");

        let mut counts = Vec::new();
        for frame in 0..frames {
            if context.is_cancelled() {
                anyhow::bail!("acquisition cancelled after {frame} frames");
            }
            thread::sleep(Duration::from_millis(20));
            counts.push(frame * frame + 1);
            context.set_result(Spectrum { counts: counts.clone() })?;
        }
        context
            .complete_observation::<Spectrum>()
            .context("failed to complete spectrum")?;
        sample.close();
        Ok(())
    }
}

pub(crate) struct Processing;

impl Executor for Processing {
    fn plan(&self, context: &mut PlanningContext<'_>) {
        context.declare_result_requirement::<Spectrum>();
    }

    fn execute(&self, context: &ExecutionContext) -> anyhow::Result<()> {
        let spectrum = context.acquire_result::<Spectrum>()?;
        while spectrum.completeness()? != Completeness::Complete {
            if context.is_cancelled() {
                anyhow::bail!("processing cancelled");
            }
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(spectrum) = spectrum.value()? {
            let total: u64 = spectrum.counts.iter().sum();
            tracing::info!(frames = spectrum.counts.len(), total, "processed spectrum");
        }
        Ok(())
    }
}

/// Executors the command line knows about
pub(crate) fn registry() -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with("sample-holder", SampleHolder)
        .with("acquisition", Acquisition)
        .with("processing", Processing)
}

/// Holder with `consumers` acquisitions, each followed by processing
pub(crate) fn procedure(consumers: usize, evaluation: Evaluation) -> anyhow::Result<Procedure> {
    let holder = Instruction::new("holder", "sample-holder")
        .with_variable("evaluation", serde_json::to_value(evaluation)?);
    let mut procedure = Procedure::new("demo").with("/holder", holder)?;
    for index in 0..consumers {
        let id = format!("acquisition-{index}");
        procedure = procedure
            .with(&format!("/holder/{id}"), Instruction::new(id.as_str(), "acquisition"))?
            .with(
                &format!("/holder/{id}/processing"),
                Instruction::new("processing", "processing"),
            )?;
    }
    Ok(procedure)
}
