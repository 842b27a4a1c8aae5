use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{RequestPrompt, Role};

/// Errors raised while building or rendering a conversation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversationError {
    #[error("the last reply is still pending")]
    PendingReply,

    #[error("conversation has no messages")]
    Empty,

    #[error("the last reply is already finished")]
    AlreadyFinished,

    #[error("template needs at least one separator")]
    MissingSeparators,

    #[error("template has no stop string for separator style {0:?}")]
    MissingStopString(SeparatorStyle),

    #[error("unknown conversation template {0}")]
    UnknownTemplate(String),

    #[error("last round needs at least three messages, have {0}")]
    NoLastRound(usize),
}

/// How turns are separated in the flat prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeparatorStyle {
    Two,
    RedPajamaChat,
}

/// Formatting rules of a model's chat template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub system: String,
    /// User and assistant labels, in that order
    pub roles: [String; 2],
    pub seps: Vec<String>,
    pub separator_style: SeparatorStyle,
    pub stop_str: String,
    pub add_bos: bool,
}

impl TemplateConfig {
    /// Look up a built-in template by name
    pub fn named(name: &str) -> Result<Self, ConversationError> {
        let (roles, seps, separator_style, stop_str, add_bos) = match name {
            "llama-2" => (["[INST]", "[/INST]"], vec![" ", " "], SeparatorStyle::Two, "[INST]", true),
            "vicuna_v1.1" => (["USER", "ASSISTANT"], vec![" ", "</s>"], SeparatorStyle::Two, "</s>", true),
            "wizardlm" => (["", "### Response"], vec!["\n\n", "</s>"], SeparatorStyle::Two, "\n\n", true),
            "redpajama_chat" => (
                ["<human>", "<bot>"],
                vec!["", ""],
                SeparatorStyle::RedPajamaChat,
                "<human>",
                false,
            ),
            "wizard_coder_or_math" => (
                ["Instruction", "Response"],
                vec!["\n\n### ", "\n\n### "],
                SeparatorStyle::Two,
                "</s>",
                true,
            ),
            other => return Err(ConversationError::UnknownTemplate(other.to_string())),
        };

        Ok(Self {
            system: String::new(),
            roles: roles.map(str::to_string),
            seps: seps.into_iter().map(str::to_string).collect(),
            separator_style,
            stop_str: stop_str.to_string(),
            add_bos,
        })
    }

    /// Stop marker that ends an assistant reply
    pub fn stop_str(&self) -> Result<&str, ConversationError> {
        if !self.stop_str.is_empty() {
            return Ok(&self.stop_str);
        }
        match self.separator_style {
            SeparatorStyle::Two => self
                .seps
                .last()
                .map(String::as_str)
                .ok_or(ConversationError::MissingSeparators),
            style => Err(ConversationError::MissingStopString(style)),
        }
    }

    pub fn user_role(&self) -> &str {
        &self.roles[0]
    }

    pub fn assistant_role(&self) -> &str {
        &self.roles[1]
    }
}

/// Role-tagged message history; `None` marks the pending reply
#[derive(Debug, Clone)]
pub struct Conversation {
    config: TemplateConfig,
    messages: Vec<(String, Option<String>)>,
}

impl Conversation {
    pub fn new(config: TemplateConfig) -> Self {
        Self {
            config,
            messages: Vec::new(),
        }
    }

    /// Build a conversation from a request prompt, ending with the assistant cue.
    ///
    /// System messages are folded into the preamble; a flat prompt becomes a
    /// single user turn.
    pub fn from_prompt(
        mut config: TemplateConfig,
        prompt: &RequestPrompt,
    ) -> Result<Self, ConversationError> {
        let mut turns = Vec::new();
        match prompt {
            RequestPrompt::Text(text) => turns.push((Role::User, text.clone())),
            RequestPrompt::Messages(messages) => {
                let mut system = Vec::new();
                for message in messages {
                    match message.role {
                        Role::System => system.push(message.content.clone()),
                        role => turns.push((role, message.content.clone())),
                    }
                }
                if !system.is_empty() {
                    config.system = system.join("\n");
                }
            }
        }

        let mut conversation = Self::new(config);
        for (role, content) in turns {
            match role {
                Role::Assistant => conversation.append_reply(&content)?,
                _ => conversation.append_prompt(&content)?,
            }
        }
        let cue = conversation.config.assistant_role().to_string();
        conversation.append_reply_header(&cue);
        Ok(conversation)
    }

    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_pending_reply(&self) -> bool {
        matches!(self.messages.last(), Some((_, None)))
    }

    pub fn append_message(&mut self, role: &str, message: &str) -> Result<(), ConversationError> {
        if self.has_pending_reply() {
            return Err(ConversationError::PendingReply);
        }
        self.messages.push((role.to_string(), Some(message.to_string())));
        Ok(())
    }

    pub fn append_prompt(&mut self, message: &str) -> Result<(), ConversationError> {
        let role = self.config.user_role().to_string();
        self.append_message(&role, message)
    }

    pub fn append_reply(&mut self, message: &str) -> Result<(), ConversationError> {
        let role = self.config.assistant_role().to_string();
        self.append_message(&role, message)
    }

    pub fn append_reply_header(&mut self, role: &str) {
        self.messages.push((role.to_string(), None));
    }

    pub fn finish_reply(&mut self, message: &str) -> Result<(), ConversationError> {
        match self.messages.last_mut() {
            None => Err(ConversationError::Empty),
            Some((_, Some(_))) => Err(ConversationError::AlreadyFinished),
            Some((_, reply)) => {
                *reply = Some(message.to_string());
                Ok(())
            }
        }
    }

    pub fn set_system(&mut self, system: &str) {
        self.config.system = system.to_string();
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// Full prompt pieces; the first element is the system preamble
    pub fn prompt_array(&self) -> Result<Vec<String>, ConversationError> {
        self.render(true, 0)
    }

    /// The last user turn and the reply cue, without the system preamble
    pub fn last_round(&self) -> Result<Vec<String>, ConversationError> {
        if self.messages.len() < 3 {
            return Err(ConversationError::NoLastRound(self.messages.len()));
        }
        self.render(false, self.messages.len() - 2)
    }

    fn render(&self, add_system: bool, start: usize) -> Result<Vec<String>, ConversationError> {
        let seps = &self.config.seps;
        if seps.is_empty() {
            return Err(ConversationError::MissingSeparators);
        }

        let mut ret = Vec::with_capacity(self.messages.len() + 1);
        if add_system {
            ret.push(format!("{}{}", self.config.system, seps[0]));
        }

        let line_end = match self.config.separator_style {
            SeparatorStyle::Two => "",
            SeparatorStyle::RedPajamaChat => "\n",
        };
        for (i, (role, message)) in self.messages.iter().enumerate().skip(start) {
            match message {
                Some(text) if !text.is_empty() => {
                    ret.push(format!("{}: {}{}{}", role, text, seps[i % seps.len()], line_end));
                }
                _ => ret.push(format!("{}:", role)),
            }
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatMessage;

    #[test]
    fn test_append_while_pending_fails() {
        let mut conv = Conversation::new(TemplateConfig::named("vicuna_v1.1").unwrap());
        conv.append_prompt("hello").unwrap();
        conv.append_reply_header("ASSISTANT");

        assert_eq!(conv.append_prompt("again"), Err(ConversationError::PendingReply));
        assert_eq!(conv.append_reply("again"), Err(ConversationError::PendingReply));

        conv.finish_reply("hi there").unwrap();
        assert!(conv.append_prompt("again").is_ok());
    }

    #[test]
    fn test_finish_reply_rules() {
        let mut conv = Conversation::new(TemplateConfig::named("llama-2").unwrap());
        assert_eq!(conv.finish_reply("x"), Err(ConversationError::Empty));

        conv.append_prompt("q").unwrap();
        assert_eq!(conv.finish_reply("x"), Err(ConversationError::AlreadyFinished));
    }

    #[test]
    fn test_vicuna_prompt_array() {
        let prompt = RequestPrompt::messages(vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("how are you"),
        ]);
        let conv = Conversation::from_prompt(TemplateConfig::named("vicuna_v1.1").unwrap(), &prompt).unwrap();

        assert_eq!(
            conv.prompt_array().unwrap(),
            vec![
                "Be brief. ".to_string(),
                "USER: hi ".to_string(),
                "ASSISTANT: hello</s>".to_string(),
                "USER: how are you ".to_string(),
                "ASSISTANT:".to_string(),
            ]
        );
        assert_eq!(
            conv.last_round().unwrap(),
            vec!["USER: how are you ".to_string(), "ASSISTANT:".to_string()]
        );
    }

    #[test]
    fn test_redpajama_adds_newlines() {
        let conv = Conversation::from_prompt(
            TemplateConfig::named("redpajama_chat").unwrap(),
            &RequestPrompt::text("hi"),
        )
        .unwrap();

        assert_eq!(
            conv.prompt_array().unwrap(),
            vec!["".to_string(), "<human>: hi\n".to_string(), "<bot>:".to_string()]
        );
        assert_eq!(conv.config().stop_str().unwrap(), "<human>");
    }

    #[test]
    fn test_stop_str_falls_back_to_last_separator() {
        let mut config = TemplateConfig::named("vicuna_v1.1").unwrap();
        config.stop_str.clear();
        assert_eq!(config.stop_str().unwrap(), "</s>");

        let mut config = TemplateConfig::named("redpajama_chat").unwrap();
        config.stop_str.clear();
        assert_eq!(
            config.stop_str(),
            Err(ConversationError::MissingStopString(SeparatorStyle::RedPajamaChat))
        );
    }

    #[test]
    fn test_missing_separators_is_malformed() {
        let mut config = TemplateConfig::named("llama-2").unwrap();
        config.seps.clear();
        let conv = Conversation::from_prompt(config, &RequestPrompt::text("hi")).unwrap();
        assert_eq!(conv.prompt_array(), Err(ConversationError::MissingSeparators));
    }

    #[test]
    fn test_unknown_template() {
        assert_eq!(
            TemplateConfig::named("gpt-9"),
            Err(ConversationError::UnknownTemplate("gpt-9".to_string()))
        );
    }
}
