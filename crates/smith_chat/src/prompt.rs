//! Prompt assembly and parsing of model output.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{ChatError, ChatResult};
use crate::llm::{GenerationOutput, GenerationRequest};
use crate::types::{Intent, MessageRole};

/// System instruction sent with every generation call.
pub const SYSTEM_INSTRUCTION: &str = "You are a world-class web developer and AI assistant. \
Your task is to generate or modify HTML, CSS, and JavaScript code based on user requests. \
Follow all instructions precisely. Return the raw code of each file, without any markdown \
formatting like ```html or ```, inside the JSON object you are asked for.";

/// Conventional files of a generated site with their fallback content.
pub const CONVENTIONAL_FILES: &[(&str, &str)] = &[
    ("index.html", "<!-- HTML generation failed -->"),
    ("styles.css", "/* CSS generation failed */"),
    ("app.js", "// JavaScript generation failed"),
];

/// Render the user prompt for a generation request.
///
/// Sections appear in a fixed order: retrieved context, conversation
/// history, current files, then the request itself.
pub fn render_prompt(request: &GenerationRequest) -> String {
    let mut prompt = String::new();

    let task = match request.intent {
        Intent::Build => {
            "Create a new static website from scratch. Produce a complete `index.html`, \
             a `styles.css` that styles it and an `app.js` that makes it interactive. \
             `index.html` must link `styles.css` and `app.js`."
        }
        Intent::Edit => {
            "Modify the existing website to satisfy the request while staying consistent \
             with its current markup, styles and scripts. Return only the files you change."
        }
        Intent::Clone => {
            "Rework the existing website so its layout and structure follow the reference \
             page described below, keeping the user's content. Return only the files you change."
        }
    };
    prompt.push_str("## Task\n");
    prompt.push_str(task);
    prompt.push_str("\n\n");

    if !request.context.is_empty() {
        prompt.push_str("## Relevant context\n");
        for block in &request.context {
            prompt.push_str(block.trim_end());
            prompt.push_str("\n\n");
        }
    }

    if !request.history.is_empty() {
        prompt.push_str("## Conversation so far\n");
        for turn in &request.history {
            let role = match turn.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            prompt.push_str(&format!("{}: {}\n", role, turn.content.trim()));
        }
        prompt.push('\n');
    }

    if !request.prior_files.is_empty() {
        prompt.push_str("## Current files\n");
        for (path, content) in &request.prior_files {
            prompt.push_str(&format!("### {}\n```{}\n{}\n```\n\n", path, fence_language(path), content.trim_end()));
        }
    }

    prompt.push_str("## Request\n");
    prompt.push_str(&format!("\"{}\"\n\n", request.instruction.trim()));

    prompt.push_str(
        "## Output format\n\
         Reply with a single JSON object and nothing else:\n\
         {\"files\": {\"<relative path>\": \"<full file content>\"}, \"explanation\": \"<one or two sentences for the user>\"}\n\
         Every file you include must contain its full content. Paths are relative to the site root.\n",
    );

    prompt
}

fn fence_language(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") | Some("htm") => "html",
        Some("css") => "css",
        Some("js") => "javascript",
        _ => "",
    }
}

#[derive(Deserialize)]
struct RawOutput {
    #[serde(default)]
    files: BTreeMap<String, String>,
    #[serde(default)]
    explanation: String,
}

/// Parse the model's JSON reply into files and an explanation.
///
/// Code fences around the JSON are tolerated. Malformed JSON, an empty file
/// set, or an unsafe path is a [`ChatError::Model`].
pub fn parse_generation_output(raw: &str) -> ChatResult<GenerationOutput> {
    let body = strip_code_fences(raw);
    let parsed: RawOutput = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(first) => {
            // Some models wrap the object in prose; retry on the outermost braces.
            let start = body.find('{');
            let end = body.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if e > s => serde_json::from_str(&body[s..=e])
                    .map_err(|e| ChatError::Model(format!("Malformed model output: {}", e)))?,
                _ => return Err(ChatError::Model(format!("Malformed model output: {}", first))),
            }
        }
    };

    if parsed.files.is_empty() {
        return Err(ChatError::Model("Model returned no files".to_string()));
    }

    let mut files = BTreeMap::new();
    for (path, content) in parsed.files {
        let normalized = path.trim().trim_start_matches("./").to_string();
        if !is_safe_relative_path(&normalized) {
            return Err(ChatError::Model(format!("Model returned an unsafe file path: {}", path)));
        }
        files.insert(normalized, strip_code_fences(&content).to_string());
    }

    Ok(GenerationOutput {
        files,
        explanation: parsed.explanation.trim().to_string(),
    })
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let after_open = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return "",
    };
    after_open
        .trim_end()
        .strip_suffix("```")
        .unwrap_or(after_open)
        .trim()
}

/// Whether `path` is a relative path that stays inside its root.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') || path.contains(':') || path.contains('\0') {
        return false;
    }
    path.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Add fallback content for any conventional file the model left out.
pub fn fill_missing_conventional(files: &mut BTreeMap<String, String>) -> Vec<String> {
    let mut filled = Vec::new();
    for (name, placeholder) in CONVENTIONAL_FILES {
        let missing = files.get(*name).map_or(true, |c| c.trim().is_empty());
        if missing {
            files.insert(name.to_string(), placeholder.to_string());
            filled.push(name.to_string());
        }
    }
    filled
}
