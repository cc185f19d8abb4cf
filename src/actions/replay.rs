use crate::actions::base::ActionResult;
use crate::actions::cache::{ActionOutcome, ActionType, CachedActionEntry};
use crate::actions::dispatcher::ActionMethod;
use crate::actions::locator::ElementLocator;
use crate::browser::BrowserSession;
use crate::core::BrowserTrait;
use crate::dom::A11yState;
use crate::errors::Result;
use crate::types::EncodedId;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// A fresh target chosen by whoever originally produced the action, usually
/// the language model.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAction {
    pub id: EncodedId,
    pub method: ActionMethod,
    pub arguments: Vec<String>,
}

/// Hook that re-resolves a cached step against the current page once
/// deterministic replay has given up.
#[async_trait]
pub trait ResolutionFallback: Send + Sync {
    async fn resolve(
        &self,
        entry: &CachedActionEntry,
        state: &A11yState,
    ) -> Result<Option<ResolvedAction>>;
}

#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub result: ActionResult,
    /// Deterministic replay gave up and the fallback hook was consulted.
    pub fell_back: bool,
    pub attempts: u32,
    /// The entry to store after a successful fallback, pointing at the
    /// element the hook picked.
    pub entry: Option<CachedActionEntry>,
}

impl ReplayOutcome {
    fn direct(result: ActionResult, attempts: u32) -> Self {
        Self {
            result,
            fell_back: false,
            attempts,
            entry: None,
        }
    }

    fn fallback_failed(message: String, attempts: u32) -> Self {
        Self {
            result: ActionResult::failure(message),
            fell_back: true,
            attempts,
            entry: None,
        }
    }
}

pub async fn replay_entry<B: BrowserTrait>(
    session: &mut BrowserSession<B>,
    entry: &CachedActionEntry,
    fallback: Option<&dyn ResolutionFallback>,
) -> Result<ReplayOutcome> {
    match entry.action_type {
        ActionType::Complete => Ok(ReplayOutcome::direct(
            ActionResult::success(entry.outcome.message.clone()),
            0,
        )),
        ActionType::Navigate => {
            let target = entry.arguments.first().unwrap_or(&entry.url).clone();
            session.navigate(&target).await?;
            Ok(ReplayOutcome::direct(
                ActionResult::success(format!("Navigated to {}", target)),
                1,
            ))
        }
        ActionType::Act => replay_act(session, entry, fallback).await,
    }
}

async fn replay_act<B: BrowserTrait>(
    session: &mut BrowserSession<B>,
    entry: &CachedActionEntry,
    fallback: Option<&dyn ResolutionFallback>,
) -> Result<ReplayOutcome> {
    let method: ActionMethod = entry.method.parse()?;
    let max_attempts = session.config().cache.max_replay_attempts.max(1);
    let mut last_failure = String::new();

    for attempt in 1..=max_attempts {
        session.wait_until_settled(None).await?;
        let state = session.extract_tree().await?;
        let locator = ElementLocator::for_state(&state, session.frame_load_timeout());

        match locator.resolve_xpath(entry.frame_index, &entry.xpath).await {
            Ok(handle) => {
                let result = session.dispatcher().dispatch(&handle, method, &entry.arguments).await;
                handle.release().await;
                session.invalidate();
                if result.success {
                    info!("Replayed {:?} on attempt {}", entry.instruction, attempt);
                    return Ok(ReplayOutcome::direct(result, attempt));
                }
                last_failure = result.message;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => last_failure = e.to_string(),
        }
        debug!(
            "Replay attempt {}/{} of {:?} failed: {}",
            attempt, max_attempts, entry.instruction, last_failure
        );
    }

    warn!(
        "Replay of {:?} failed after {} attempts: {}",
        entry.instruction, max_attempts, last_failure
    );

    if let Some(fallback) = fallback {
        let state = session.extract_tree().await?;
        // The hook is an external collaborator; its failures degrade the
        // step instead of aborting the replay.
        let resolved = match fallback.resolve(entry, &state).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Fallback for {:?} failed: {}", entry.instruction, e);
                return Ok(ReplayOutcome::fallback_failed(
                    format!("Fallback resolution failed: {}", e),
                    max_attempts,
                ));
            }
        };
        if let Some(resolved) = resolved {
            let dispatched = session
                .dispatch_on_state(&state, resolved.id, resolved.method, &resolved.arguments)
                .await;
            let (result, target) = match dispatched {
                Ok(dispatched) => dispatched,
                Err(e) => {
                    warn!(
                        "Fallback target {} for {:?} is unusable: {}",
                        resolved.id, entry.instruction, e
                    );
                    return Ok(ReplayOutcome::fallback_failed(
                        format!("Fallback target {} is unusable: {}", resolved.id, e),
                        max_attempts,
                    ));
                }
            };
            let refreshed = target.filter(|_| result.success).map(|(frame_index, xpath)| {
                CachedActionEntry::act(
                    entry.instruction.clone(),
                    state.url.clone(),
                    resolved.method.as_str(),
                    resolved.arguments.clone(),
                    frame_index,
                    xpath,
                    ActionOutcome {
                        success: true,
                        message: result.message.clone(),
                    },
                )
            });
            return Ok(ReplayOutcome {
                result,
                fell_back: true,
                attempts: max_attempts,
                entry: refreshed,
            });
        }
        debug!("Fallback declined to resolve {:?}", entry.instruction);
    }

    Ok(ReplayOutcome::direct(
        ActionResult::failure(format!(
            "Replay failed after {} attempts: {}",
            max_attempts, last_failure
        )),
        max_attempts,
    ))
}
