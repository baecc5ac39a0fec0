//! Post-execution hooks (§4.6): housekeeping that runs once per processed
//! message, after the plan runtime has produced its outcome. Six steps —
//! fact-use bookkeeping, learning disposition, summary rewrite, fact
//! consolidation, fact decay/archival, and plan-usage accounting (the last
//! of which is already recorded per-call by [`crate::kernel::plan::run_plan`]
//! and needs no extra work here).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::config::{KnowledgeConfig, LlmConfig};
use crate::kernel::roles::{
    self, ConsolidatedFact, CuratorVerdict, Role as PipelineRole, RoleContext,
};
use crate::kernel::template::TemplateRegistry;
use crate::llm::{LlmGateway, MessageBudget};
use crate::store::Store;
use crate::types::{LearningStatus, PendingScope};

/// Run all six post-execution hooks for `session_id`. Each step is
/// independent; a failure in one is logged and does not block the rest.
///
/// # Errors
///
/// Returns an error only if the session's own facts/messages cannot be
/// read at all — individual LLM-backed steps degrade to a log line.
pub async fn run_post_execution_hooks(
    store: &Store,
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    templates: &TemplateRegistry,
    knowledge: &KnowledgeConfig,
    session_id: &str,
) -> anyhow::Result<()> {
    // Snapshot each visible fact's staleness *before* step 1 touches it.
    // Step 1 bumps `last_used` to now on every visible fact every cycle, so
    // if step 5 measured staleness off the store's post-bump state it would
    // always see "used moments ago" — dead decay, worst for globally-visible
    // `project`/`tool`/`general` facts that some session's cycle bumps
    // continuously. Step 5 instead measures from this pre-bump snapshot.
    let pre_cycle_last_used = snapshot_last_used(store, session_id).await?;
    bump_fact_use(store, session_id).await?;
    dispose_learnings(store, gateway, budget, llm_config, templates, session_id).await;
    maybe_resummarize(store, gateway, budget, llm_config, templates, knowledge, session_id).await;
    maybe_consolidate_facts(store, gateway, budget, llm_config, templates, knowledge, session_id).await;
    decay_facts(store, knowledge, session_id, &pre_cycle_last_used).await?;
    Ok(())
}

/// Each fact visible to `session_id`, keyed by id, with its staleness
/// timestamp as of *before* this cycle's step 1 bump.
async fn snapshot_last_used(
    store: &Store,
    session_id: &str,
) -> anyhow::Result<HashMap<i64, DateTime<Utc>>> {
    Ok(store
        .facts_visible_to(session_id)
        .await?
        .into_iter()
        .map(|fact| (fact.id, fact.last_used.unwrap_or(fact.created_at)))
        .collect())
}

/// Step 1: bump `use_count`/`last_used` on every fact visible to this
/// session. Facts referenced in a plan's context but not this session's
/// own are approximated as "everything the context builder would have
/// shown" rather than tracking which individual facts a role actually
/// read from the rendered prompt.
async fn bump_fact_use(store: &Store, session_id: &str) -> anyhow::Result<()> {
    for fact in store.facts_visible_to(session_id).await? {
        store.record_fact_use(fact.id).await?;
    }
    Ok(())
}

/// Step 2: if there are pending learnings for this session, ask the
/// curator to dispose of each — promote to a fact, ask an operator, or
/// discard.
async fn dispose_learnings(
    store: &Store,
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    templates: &TemplateRegistry,
    session_id: &str,
) {
    let all_pending = match store.pending_learnings().await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(session = %session_id, error = %e, "failed to fetch pending learnings");
            return;
        }
    };
    let pending: Vec<_> = all_pending.into_iter().filter(|l| l.session == session_id).collect();
    if pending.is_empty() {
        return;
    }

    let mut ctx = RoleContext::default();
    ctx.pending_learnings = pending;
    if let Ok(facts) = store.facts_visible_to(session_id).await {
        ctx.facts = facts;
    }

    let prompt = templates.load(PipelineRole::Curator);
    let outcome = roles::invoke_curator(gateway, budget, llm_config, &prompt, &ctx).await;
    let Ok(Some((output, _completion))) = outcome else {
        if let Err(e) = outcome {
            tracing::warn!(session = %session_id, error = %e, "curator call failed");
        }
        return;
    };

    for evaluation in output.evaluations {
        let result = match evaluation.verdict {
            CuratorVerdict::Promote => {
                if let Some(fact) = evaluation.fact {
                    store
                        .insert_fact(&fact.content, fact.category, 1.0, session_id)
                        .await
                        .map(|_| ())
                } else {
                    Ok(())
                }
            }
            CuratorVerdict::Ask => {
                if let Some(question) = evaluation.question {
                    store
                        .insert_pending_item(PendingScope::Session, Some(session_id), &question)
                        .await
                        .map(|_| ())
                } else {
                    Ok(())
                }
            }
            CuratorVerdict::Discard => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(session = %session_id, learning = evaluation.learning_id, error = %e, "failed to apply curator verdict");
        }
        let status = match evaluation.verdict {
            CuratorVerdict::Promote => LearningStatus::Promoted,
            CuratorVerdict::Ask => LearningStatus::Asked,
            CuratorVerdict::Discard => LearningStatus::Discarded,
        };
        if let Err(e) = store
            .set_learning_status(evaluation.learning_id, status, evaluation.reason.as_deref())
            .await
        {
            tracing::warn!(session = %session_id, learning = evaluation.learning_id, error = %e, "failed to record learning disposition");
        }
    }
}

/// Step 3: if enough raw messages have accumulated since the last
/// summarization, fold them into the rolling summary and advance the
/// cursor.
async fn maybe_resummarize(
    store: &Store,
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    templates: &TemplateRegistry,
    knowledge: &KnowledgeConfig,
    session_id: &str,
) {
    let batch = match store.messages_since_summary(session_id).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(session = %session_id, error = %e, "failed to fetch messages since last summary");
            return;
        }
    };
    if (batch.len() as u32) < knowledge.summarize_threshold {
        return;
    }

    let Ok(Some(session)) = store.get_session(session_id).await else {
        return;
    };
    let last_id = batch.last().map(|(m, _)| m.id).unwrap_or(0);

    let mut ctx = RoleContext::default();
    if !session.summary.is_empty() {
        ctx.session_summary = Some(session.summary.clone());
    }
    ctx.messages_to_compress =
        batch.into_iter().map(|(m, output)| (format!("{}: {}", m.user, m.content), output)).collect();

    let prompt = templates.load(PipelineRole::Summarizer);
    match roles::invoke_summarizer_rewrite(gateway, budget, llm_config, &prompt, &ctx).await {
        Ok(completion) => {
            if let Err(e) = store.update_summary(session_id, completion.text.trim()).await {
                tracing::warn!(session = %session_id, error = %e, "failed to persist rewritten summary");
                return;
            }
            if let Err(e) = store.mark_summarized(session_id, last_id).await {
                tracing::warn!(session = %session_id, error = %e, "failed to advance summarization cursor");
            }
        }
        Err(e) => tracing::warn!(session = %session_id, error = %e, "summarizer rewrite failed"),
    }
}

/// Step 4: if the total fact count has grown past the configured
/// ceiling, ask the summarizer to consolidate into a smaller, higher-
/// quality set. Guards against a degenerate response collapsing the
/// knowledge base: aborts if the new list is under 30% of the old size,
/// or if most entries are suspiciously short.
async fn maybe_consolidate_facts(
    store: &Store,
    gateway: &LlmGateway,
    budget: &MessageBudget,
    llm_config: &LlmConfig,
    templates: &TemplateRegistry,
    knowledge: &KnowledgeConfig,
    session_id: &str,
) {
    let facts = match store.facts_visible_to(session_id).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(session = %session_id, error = %e, "failed to fetch facts for consolidation check");
            return;
        }
    };
    if (facts.len() as u32) < knowledge.knowledge_max_facts {
        return;
    }

    let mut ctx = RoleContext::default();
    ctx.facts = facts.clone();
    let prompt = templates.load(PipelineRole::Summarizer);
    let consolidated: Vec<ConsolidatedFact> =
        match roles::invoke_summarizer_consolidate(gateway, budget, llm_config, &prompt, &ctx).await {
            Ok((parsed, _completion)) => parsed,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "fact consolidation call failed");
                return;
            }
        };

    let old_count = facts.len();
    let min_acceptable = ((old_count as f64) * 0.3).ceil() as usize;
    let short_count = consolidated.iter().filter(|f| f.content.len() < 10).count();
    if consolidated.len() < min_acceptable || short_count * 2 > consolidated.len() {
        tracing::warn!(
            session = %session_id,
            old_count,
            new_count = consolidated.len(),
            "fact consolidation produced a suspiciously degraded set, discarding"
        );
        return;
    }

    for fact in &facts {
        if let Err(e) = store.decay_and_maybe_archive_fact(fact.id, 0.0, 1.0, "consolidated").await {
            tracing::warn!(session = %session_id, fact = fact.id, error = %e, "failed to archive fact during consolidation");
        }
    }
    for fact in consolidated {
        if let Err(e) = store.insert_fact(&fact.content, fact.category, fact.confidence, session_id).await {
            tracing::warn!(session = %session_id, error = %e, "failed to insert consolidated fact");
        }
    }
}

/// Step 5: decay confidence on facts unused for `fact_decay_days`,
/// archiving any that fall below `fact_archive_threshold`. Staleness is
/// measured from `pre_cycle_last_used`, not the fact's current `last_used`,
/// since step 1 already bumped the latter to now this cycle. A fact absent
/// from the snapshot (created this cycle, e.g. by the curator) falls back
/// to its own `last_used`/`created_at` and so is never treated as stale.
async fn decay_facts(
    store: &Store,
    knowledge: &KnowledgeConfig,
    session_id: &str,
    pre_cycle_last_used: &HashMap<i64, DateTime<Utc>>,
) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    for fact in store.facts_visible_to(session_id).await? {
        let stale_since = pre_cycle_last_used
            .get(&fact.id)
            .copied()
            .unwrap_or_else(|| fact.last_used.unwrap_or(fact.created_at));
        let days_unused = (now - stale_since).num_days();
        if days_unused < knowledge.fact_decay_days {
            continue;
        }
        let decayed = (fact.confidence - knowledge.fact_decay_rate).max(0.0);
        store
            .decay_and_maybe_archive_fact(fact.id, decayed, knowledge.fact_archive_threshold, "decayed")
            .await?;
    }
    Ok(())
}
