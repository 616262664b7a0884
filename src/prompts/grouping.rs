use crate::processor::grouping::TabDescriptor;
use crate::runtime::{ChatMessage, Role};

/// Tabs past this many are left out of the prompt.
pub const MAX_PROMPT_TABS: usize = 150;
const HOST_MAX_CHARS: usize = 30;
const TITLE_MAX_CHARS: usize = 60;

const INTRO: &str = "You sort open browser tabs into a few short, topical groups.";
const RESPONSE_HEADER: &str = "Respond with JSON only, in exactly this shape:";
const OUTPUT_FORMAT: &str = "{\"groups\": [{\"name\": \"Dev\", \"ids\": [0, 3]}]}";
const RULES_HEADER: &str = "Rules:";
const RULES: &[&str] = &[
    "ids are the tab numbers shown in square brackets, not anything else.",
    "Every group needs at least 2 tabs.",
    "A tab belongs to at most one group.",
    "Group names are one short word, at most 8 characters.",
    "Leave a tab out when no group fits it.",
];
const HINTS_HEADER: &str = "Domain hints:";
const DOMAIN_HINTS: &[(&str, &str)] = &[
    ("github.com, gitlab.com, stackoverflow.com, docs.rs", "Dev"),
    ("youtube.com, netflix.com, twitch.tv", "Video"),
    ("reddit.com, x.com, twitter.com, linkedin.com", "Social"),
    ("mail.google.com, outlook.live.com", "Email"),
    ("amazon.com, ebay.com, etsy.com", "Shop"),
    ("nytimes.com, bbc.co.uk, theguardian.com", "News"),
    ("docs.google.com, notion.so, confluence", "Docs"),
];
const EXAMPLES_HEADER: &str = "Example:";
const EXAMPLE_INPUT: &str = "[0] github.com | tokio-rs/tokio: A runtime for writing reliable asynchronous applications\n[1] youtube.com | Rust in 100 Seconds\n[2] docs.rs | tokio::sync::watch - Rust\n[3] youtube.com | Lo-fi beats to code to\n[4] amazon.com | USB-C hub";
const EXAMPLE_OUTPUT: &str =
    "{\"groups\": [{\"name\": \"Dev\", \"ids\": [0, 2]}, {\"name\": \"Video\", \"ids\": [1, 3]}]}";

/// System and user messages for one grouping request.
pub fn build_grouping_messages(tabs: &[TabDescriptor]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::new(Role::System, build_system_prompt()),
        ChatMessage::new(Role::User, build_tab_list(tabs)),
    ]
}

fn build_system_prompt() -> String {
    let rules = RULES
        .iter()
        .map(|rule| format!("- {rule}"))
        .collect::<Vec<_>>()
        .join("\n");
    let hints = DOMAIN_HINTS
        .iter()
        .map(|(domains, name)| format!("- {domains} -> {name}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{INTRO}\n\n{RESPONSE_HEADER}\n{OUTPUT_FORMAT}\n\n{RULES_HEADER}\n{rules}\n\n{HINTS_HEADER}\n{hints}\n\n{EXAMPLES_HEADER}\nTabs:\n{EXAMPLE_INPUT}\nOUTPUT: {EXAMPLE_OUTPUT}\n"
    )
}

/// One line per tab: positional index, short host, short title.
fn build_tab_list(tabs: &[TabDescriptor]) -> String {
    let mut out = String::from("Tabs:\n");
    for (index, tab) in tabs.iter().take(MAX_PROMPT_TABS).enumerate() {
        out.push_str(&format!(
            "[{index}] {} | {}\n",
            truncate(&host_of(&tab.url), HOST_MAX_CHARS),
            truncate(tab.title.trim(), TITLE_MAX_CHARS),
        ));
    }
    out.push_str("OUTPUT:");
    out
}

fn host_of(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.trim_start_matches("www.").to_string(),
            None => parsed.scheme().to_string(),
        },
        Err(_) => raw.trim().to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
