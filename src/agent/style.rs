//! Per-channel system prompt hints.
//!
//! Each chat platform has its own formatting conventions and social
//! register (Slack threads read differently than a Telegram DM); the
//! agent loop appends a short hint describing the destination channel
//! so the model can shape its reply accordingly. Templates are rendered
//! through `minijinja`, used wherever a prompt fragment needs a variable
//! substituted in.

use crate::ChannelType;
use minijinja::{context, Environment};
use std::sync::LazyLock;

const HINT_TEMPLATE: &str = "\n\nYou are replying on {{ channel }}. {{ guidance }}";

static ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("channel_hint", HINT_TEMPLATE)
        .expect("hardcoded channel hint template is valid");
    env
});

fn guidance_for(channel_type: ChannelType) -> &'static str {
    match channel_type {
        ChannelType::Telegram => {
            "Use Markdown sparingly; keep messages under roughly 4000 characters."
        }
        ChannelType::Whatsapp => "Keep replies short and conversational; avoid rich formatting.",
        ChannelType::Email => {
            "Write in full sentences with a greeting and sign-off; formatting is plain text."
        }
        ChannelType::Slack => {
            "Use Slack's mrkdwn formatting; keep messages under roughly 3000 characters."
        }
        ChannelType::Discord => {
            "Use Discord's Markdown formatting; keep messages under roughly 1990 characters."
        }
        ChannelType::Mattermost => "Use standard Markdown; replies are posted via a webhook.",
        ChannelType::Webhook => "The caller consumes raw text; avoid chat-platform formatting.",
        ChannelType::WebWidget => "Keep replies concise; the widget renders plain text.",
    }
}

/// Render the system-prompt addendum for `channel_type`.
pub fn hint(channel_type: ChannelType) -> String {
    let template = ENV.get_template("channel_hint").expect("registered at startup");
    template
        .render(context! { channel => channel_type.to_string(), guidance => guidance_for(channel_type) })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_channel_type_renders_a_non_empty_hint() {
        for channel_type in [
            ChannelType::Telegram,
            ChannelType::Whatsapp,
            ChannelType::Email,
            ChannelType::Slack,
            ChannelType::Discord,
            ChannelType::Mattermost,
            ChannelType::Webhook,
            ChannelType::WebWidget,
        ] {
            let rendered = hint(channel_type);
            assert!(rendered.contains(&channel_type.to_string()));
        }
    }
}
