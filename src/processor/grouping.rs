//! Tab grouping: prompt the engine, parse its answer, map indices back to tab ids.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::consts::{GROUP_NAME_MAX_CHARS, GROUPING_MIN_TOKENS, GROUPING_TOKENS_PER_TAB};
use crate::engine::EngineManager;
use crate::error::{ParseError, ProcessError};
use crate::parser::{self, ParseOutcome, ParsedGroup};
use crate::prompts::grouping::build_grouping_messages;
use crate::runtime::CompletionRequest;

/// A tab as sent by the caller. `id` is caller-assigned and unique per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabDescriptor {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

/// An accepted group, in terms of the caller's tab ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabGroup {
    pub name: String,
    pub tab_ids: Vec<i64>,
}

/// Groups smaller than this after remapping are dropped.
const MIN_GROUP_SIZE: usize = 2;

/// Grouping is classification; always sample greedily.
const GROUPING_TEMPERATURE: f32 = 0.0;

pub async fn group_tabs(
    manager: &EngineManager,
    tabs: &[TabDescriptor],
) -> Result<Vec<TabGroup>, ProcessError> {
    manager.ensure_ready(None).await.map_err(ProcessError::Init)?;

    if tabs.len() < MIN_GROUP_SIZE {
        return Err(ParseError::NoValidGroups.into());
    }

    let request = CompletionRequest::new(
        build_grouping_messages(tabs),
        token_budget(tabs.len()),
        GROUPING_TEMPERATURE,
    );
    let raw = manager
        .complete(&request)
        .await
        .map_err(|e| ProcessError::Inference(format!("{e:#}")))?;

    let proposed = match parser::parse(&raw)? {
        ParseOutcome::Groups { groups, reasoning } => {
            if let Some(reasoning) = reasoning {
                debug!(%reasoning, "model reasoning");
            }
            groups
        }
        ParseOutcome::Categories(labels) => groups_from_categories(labels),
    };

    let groups = remap(&proposed, tabs);
    if groups.is_empty() {
        debug!(proposed = proposed.len(), "every proposed group was filtered out");
        return Err(ParseError::NoValidGroups.into());
    }

    info!(tabs = tabs.len(), groups = groups.len(), "grouped tabs");
    Ok(groups)
}

pub fn token_budget(tab_count: usize) -> u32 {
    let per_tab = u32::try_from(tab_count)
        .unwrap_or(u32::MAX)
        .saturating_mul(GROUPING_TOKENS_PER_TAB);
    per_tab.max(GROUPING_MIN_TOKENS)
}

/// Map positional indices to caller ids.
///
/// Out-of-range indices are dropped. A tab already claimed by an earlier
/// surviving group is dropped from later ones. Groups left with fewer than
/// two tabs are discarded and claim nothing.
pub fn remap(proposed: &[ParsedGroup], tabs: &[TabDescriptor]) -> Vec<TabGroup> {
    let mut claimed = vec![false; tabs.len()];
    let mut groups = Vec::new();

    for group in proposed {
        let members: Vec<usize> = group
            .ids
            .iter()
            .filter_map(|&index| usize::try_from(index).ok())
            .filter(|&index| index < tabs.len() && !claimed[index])
            .collect();

        if members.len() < MIN_GROUP_SIZE {
            continue;
        }
        for &index in &members {
            claimed[index] = true;
        }
        groups.push(TabGroup {
            name: truncate_name(&group.name),
            tab_ids: members.iter().map(|&index| tabs[index].id).collect(),
        });
    }
    groups
}

/// Fold an index-to-label map into groups, ordered by each label's lowest index.
fn groups_from_categories(labels: impl IntoIterator<Item = (i64, String)>) -> Vec<ParsedGroup> {
    let mut groups: Vec<ParsedGroup> = Vec::new();
    for (index, label) in labels {
        match groups.iter_mut().find(|g| g.name == label) {
            Some(group) => group.ids.push(index),
            None => groups.push(ParsedGroup {
                name: label,
                ids: vec![index],
            }),
        }
    }
    groups
}

fn truncate_name(name: &str) -> String {
    name.chars()
        .take(GROUP_NAME_MAX_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
}
