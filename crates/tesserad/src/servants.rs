//! Servants hosted by the daemon.

use async_trait::async_trait;

use tessera_core::{Ref, Text};
use tessera_services::{ServantContext, ServantError, Servant};

fn text_arg(ctx: &ServantContext, params: &[Ref]) -> Result<Text, ServantError> {
    let [arg] = params else {
        return Err(ServantError::new(
            "arity",
            format!("expected one argument, got {}", params.len()),
        ));
    };
    Ok(ctx.mosaic.resolve_object(arg)?)
}

/// Answers a greeting.
pub struct Echo;

#[async_trait]
impl Servant for Echo {
    async fn call(&self, ctx: &ServantContext, params: Vec<Ref>) -> Result<Ref, ServantError> {
        let text = text_arg(ctx, &params)?;
        tracing::debug!(caller = %ctx.caller.short(), "echo");
        Ok(ctx.mosaic.put(&Text::new(format!("{} to you too", text.as_str())))?)
    }
}

/// Always raises, with the argument as the message.
pub struct Fail;

#[async_trait]
impl Servant for Fail {
    async fn call(&self, ctx: &ServantContext, params: Vec<Ref>) -> Result<Ref, ServantError> {
        let text = text_arg(ctx, &params)?;
        Err(ServantError::new("requested", text.as_str()))
    }
}

/// Panics. The caller sees an EXCEPTION on pipes.
pub struct Crash;

#[async_trait]
impl Servant for Crash {
    async fn call(&self, _ctx: &ServantContext, _params: Vec<Ref>) -> Result<Ref, ServantError> {
        panic!("crash requested");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tessera_core::Mosaic;

    fn ctx() -> ServantContext {
        ServantContext {
            mosaic: Arc::new(Mosaic::new()),
            caller: Ref::from_hash([7; 32]),
        }
    }

    #[tokio::test]
    async fn echo_answers() {
        let ctx = ctx();
        let arg = ctx.mosaic.put(&Text::new("hello")).unwrap();
        let out = Echo.call(&ctx, vec![arg]).await.unwrap();
        let text: Text = ctx.mosaic.resolve_object(&out).unwrap();
        assert_eq!(text.as_str(), "hello to you too");
    }

    #[tokio::test]
    async fn echo_wants_exactly_one_argument() {
        let err = Echo.call(&ctx(), vec![]).await.unwrap_err();
        assert_eq!(err.error_type, "arity");
    }

    #[tokio::test]
    async fn fail_raises_with_message() {
        let ctx = ctx();
        let arg = ctx.mosaic.put(&Text::new("no thanks")).unwrap();
        let err = Fail.call(&ctx, vec![arg]).await.unwrap_err();
        assert_eq!(err, ServantError::new("requested", "no thanks"));
    }
}
