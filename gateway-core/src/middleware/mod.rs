//! The middleware pipeline: a fixed six-stage chain run around every
//! dispatched tool call, with per-stage timeouts and abort propagation.

pub mod context;
pub mod health_check;
pub mod load_balancer;

pub use context::{CancelSignal, Context, PipelineState, Stage};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayError;

const DEFAULT_STAGE_TIMEOUT_MS: u64 = 5_000;

/// One piece of middleware. A hook may implement any subset of the six
/// stages; the default no-op lets implementors only override what they
/// need, mirroring the "missing hooks are skipped" rule.
#[async_trait]
pub trait MiddlewareHook: Send + Sync {
    async fn before_agent(&self, _ctx: &Context, _state: &mut PipelineState) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn before_model(&self, _ctx: &Context, _state: &mut PipelineState) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn after_model(&self, _ctx: &Context, _state: &mut PipelineState) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn before_tool(&self, _ctx: &Context, _state: &mut PipelineState) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn after_tool(&self, _ctx: &Context, _state: &mut PipelineState) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn after_agent(&self, _ctx: &Context, _state: &mut PipelineState) -> Result<(), GatewayError> {
        Ok(())
    }
}

async fn run_hook(
    hook: &dyn MiddlewareHook,
    stage: Stage,
    ctx: &Context,
    state: &mut PipelineState,
) -> Result<(), GatewayError> {
    match stage {
        Stage::BeforeAgent => hook.before_agent(ctx, state).await,
        Stage::BeforeModel => hook.before_model(ctx, state).await,
        Stage::AfterModel => hook.after_model(ctx, state).await,
        Stage::BeforeTool => hook.before_tool(ctx, state).await,
        Stage::AfterTool => hook.after_tool(ctx, state).await,
        Stage::AfterAgent => hook.after_agent(ctx, state).await,
    }
}

pub struct Pipeline {
    hooks: Vec<Box<dyn MiddlewareHook>>,
    stage_timeout_ms: u64,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        }
    }

    pub fn with_stage_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.stage_timeout_ms = timeout_ms;
        self
    }

    pub fn register(mut self, hook: Box<dyn MiddlewareHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Run every stage in order, short-circuiting on abort, cancellation,
    /// or a per-stage timeout. A second call against an already-aborted
    /// state is a no-op.
    pub async fn execute(&self, ctx: &Context, state: &mut PipelineState) {
        if state.aborted {
            return;
        }

        for stage in Stage::ORDER {
            state.stage = stage;
            let deadline = Duration::from_millis(self.stage_timeout_ms);

            let stage_fut = async {
                for hook in &self.hooks {
                    if let Some(cancel) = &ctx.cancel {
                        if cancel.is_cancelled() {
                            return Err(GatewayError::Canceled(format!(
                                "request {} canceled during {:?}",
                                ctx.request_id, stage
                            )));
                        }
                    }
                    if let Err(err) = run_hook(hook.as_ref(), stage, ctx, state).await {
                        return Err(err);
                    }
                    if state.aborted {
                        return Ok(());
                    }
                }
                Ok(())
            };

            let outcome = if let Some(cancel) = &ctx.cancel {
                tokio::select! {
                    result = tokio::time::timeout(deadline, stage_fut) => result,
                    _ = cancel.cancelled() => Ok(Err(GatewayError::Canceled(format!(
                        "request {} canceled during {:?}",
                        ctx.request_id, stage
                    )))),
                }
            } else {
                tokio::time::timeout(deadline, stage_fut).await
            };

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    state.abort(err);
                    return;
                }
                Err(_elapsed) => {
                    state.abort(GatewayError::StageTimeout(format!("{:?} exceeded {}ms", stage, self.stage_timeout_ms)));
                    return;
                }
            }

            if state.aborted {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AbortingHook;

    #[async_trait]
    impl MiddlewareHook for AbortingHook {
        async fn before_model(&self, _ctx: &Context, state: &mut PipelineState) -> Result<(), GatewayError> {
            state.abort(GatewayError::PolicyViolation("blocked".into()));
            Ok(())
        }
    }

    struct RecordingHook(&'static str);

    #[async_trait]
    impl MiddlewareHook for RecordingHook {
        async fn before_agent(&self, _ctx: &Context, state: &mut PipelineState) -> Result<(), GatewayError> {
            state.values.insert(self.0.to_string(), serde_json::json!(true));
            Ok(())
        }
    }

    struct SlowHook;

    #[async_trait]
    impl MiddlewareHook for SlowHook {
        async fn before_agent(&self, _ctx: &Context, _state: &mut PipelineState) -> Result<(), GatewayError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn abort_stops_subsequent_stages() {
        let pipeline = Pipeline::new().register(Box::new(AbortingHook)).register(Box::new(RecordingHook("late")));
        let ctx = Context::new("req-1");
        let mut state = PipelineState::new();
        pipeline.execute(&ctx, &mut state).await;

        assert!(state.aborted);
        assert!(state.values.get("late").is_none());
    }

    #[tokio::test]
    async fn second_execute_on_aborted_state_is_a_no_op() {
        let pipeline = Pipeline::new().register(Box::new(AbortingHook));
        let ctx = Context::new("req-1");
        let mut state = PipelineState::new();
        pipeline.execute(&ctx, &mut state).await;
        let error_before = state.error.as_ref().map(|e| e.to_string());

        pipeline.execute(&ctx, &mut state).await;
        assert_eq!(state.error.as_ref().map(|e| e.to_string()), error_before);
    }

    #[tokio::test]
    async fn stage_timeout_aborts_with_stage_timeout_error() {
        let pipeline = Pipeline::new().with_stage_timeout_ms(10).register(Box::new(SlowHook));
        let ctx = Context::new("req-1");
        let mut state = PipelineState::new();
        pipeline.execute(&ctx, &mut state).await;

        assert!(state.aborted);
        assert!(matches!(state.error, Some(GatewayError::StageTimeout(_))));
    }

    #[tokio::test]
    async fn cancel_signal_aborts_with_canceled_error() {
        let cancel = CancelSignal::new();
        let pipeline = Pipeline::new().register(Box::new(SlowHook));
        let ctx = Context::new("req-1").with_cancel(cancel.clone());
        let mut state = PipelineState::new();

        cancel.cancel();
        pipeline.execute(&ctx, &mut state).await;

        assert!(state.aborted);
        assert!(matches!(state.error, Some(GatewayError::Canceled(_))));
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order_within_a_stage() {
        let pipeline = Pipeline::new()
            .register(Box::new(RecordingHook("first")))
            .register(Box::new(RecordingHook("second")));
        let ctx = Context::new("req-1");
        let mut state = PipelineState::new();
        pipeline.execute(&ctx, &mut state).await;

        assert!(!state.aborted);
        assert!(state.values.contains_key("first"));
        assert!(state.values.contains_key("second"));
    }
}
