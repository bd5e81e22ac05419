use minijinja::{context, Environment};
use serde::Serialize;

use crate::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparatorStyle {
    /// `system sep (role message sep)* role`
    Mpt,
    /// Messages only, each followed by `sep`.
    Plain,
}

impl SeparatorStyle {
    fn template(&self) -> &'static str {
        match self {
            Self::Mpt => "{{ system }}{{ sep }}{% for m in messages %}{{ m.role }}{% if m.content %}{{ m.content }}{{ sep }}{% endif %}{% endfor %}",
            Self::Plain => "{{ system }}{% for m in messages %}{% if m.content %}{{ m.content }}{{ sep }}{% endif %}{% endfor %}",
        }
    }
}

/// A named conversation layout.
#[derive(Debug, PartialEq, Eq)]
pub struct ConversationTemplate {
    pub name: &'static str,
    pub system: &'static str,
    /// User role, then assistant role.
    pub roles: [&'static str; 2],
    pub sep: &'static str,
    pub style: SeparatorStyle,
    /// Whether the tokenizer of this family prefixes the prompt with its BOS token.
    pub add_bos: bool,
}

static TEMPLATES: [ConversationTemplate; 3] = [
    ConversationTemplate {
        name: "phi3_instruct",
        system: "<|system|>\nYou are a helpful assistant.",
        roles: ["\n<|user|>\n", "\n<|assistant|>\n"],
        sep: "<|end|>",
        style: SeparatorStyle::Mpt,
        add_bos: true,
    },
    ConversationTemplate {
        name: "phi4_instruct",
        system: "<|im_start|>system<|im_sep|>You are a helpful assistant.",
        roles: ["<|im_start|>user<|im_sep|>", "<|im_start|>assistant<|im_sep|>"],
        sep: "<|im_end|>",
        style: SeparatorStyle::Mpt,
        add_bos: false,
    },
    ConversationTemplate {
        name: "plain",
        system: "",
        roles: ["", ""],
        sep: "\n",
        style: SeparatorStyle::Plain,
        add_bos: true,
    },
];

impl ConversationTemplate {
    pub fn by_name(name: &str) -> Result<&'static Self, ConfigError> {
        TEMPLATES
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ConfigError::UnknownTemplate(name.to_string()))
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        TEMPLATES.iter().map(|t| t.name)
    }

    pub fn conversation(&'static self) -> Conversation {
        Conversation {
            template: self,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
struct Turn {
    role: &'static str,
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    template: &'static ConversationTemplate,
    messages: Vec<Turn>,
}

impl Conversation {
    pub fn template(&self) -> &'static ConversationTemplate {
        self.template
    }

    /// A `None` message leaves the role open for the model to complete.
    pub fn append_message(&mut self, role: Role, content: Option<String>) {
        let role = match role {
            Role::User => self.template.roles[0],
            Role::Assistant => self.template.roles[1],
        };
        self.messages.push(Turn { role, content });
    }

    pub fn get_prompt(&self) -> Result<String, minijinja::Error> {
        let mut env = Environment::new();
        env.set_lstrip_blocks(true);
        env.set_trim_blocks(true);
        env.add_template("conversation", self.template.style.template())?;
        let tmpl = env.get_template("conversation")?;
        tmpl.render(context! {
            system => self.template.system,
            sep => self.template.sep,
            messages => self.messages,
        })
    }
}
