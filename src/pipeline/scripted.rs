/// Pipelines that play back a fixed script of steps
///
/// The script is produced per attempt, so a pipeline can fail its first attempt
/// and succeed on the retry.

use crate::pipeline::{EventStream, Pipeline, PipelineEvent, RunContext};
use crate::runtime::RunError;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted action
#[derive(Debug)]
pub enum Step {
    Emit(PipelineEvent),
    Sleep(Duration),
    /// Yield the error and end the stream
    Fail(RunError),
}

type Script = dyn Fn(&RunContext) -> Vec<Step> + Send + Sync;

pub struct ScriptedPipeline {
    script: Arc<Script>,
    invocations: AtomicUsize,
}

impl ScriptedPipeline {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&RunContext) -> Vec<Step> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Number of times the pipeline was asked for a stream
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Pipeline for ScriptedPipeline {
    fn stream(&self, ctx: RunContext) -> EventStream {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let steps = (self.script)(&ctx);

        futures::stream::unfold(Some(steps.into_iter()), |state| async move {
            let mut steps = state?;
            loop {
                match steps.next()? {
                    Step::Sleep(duration) => tokio::time::sleep(duration).await,
                    Step::Emit(event) => return Some((Ok(event), Some(steps))),
                    Step::Fail(err) => return Some((Err(err), None)),
                }
            }
        })
        .boxed()
    }
}
