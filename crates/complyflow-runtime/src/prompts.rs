//! Prompts for category evaluators.
//!
//! Layout of a request:
//! 1. Base prompt (shared by every category)
//! 2. Category prompt (built-in for regulatory, brand and seo; generic otherwise)
//! 3. User message carrying the rules and the content unit

use complyflow_core::{CategoryKey, RuleDefinition};

use crate::evaluator::ValidationFailed;

/// Shared system prompt. Establishes the reply contract.
pub const BASE_SYSTEM_PROMPT: &str = r#"
Analyze the content against the provided rules. Return ONLY valid JSON.

## Constraints
1. Check ONLY the rules you are given - do not invent criteria
2. Report a violation only when the content itself breaks a rule
3. Quote the offending text in `current_text`
4. Use the `rule_id` of the rule that is broken; use null if no single rule applies
5. An empty `violations` array is a valid answer

## Output Format (JSON)
{
  "violations": [
    {
      "category": "the category you were assigned",
      "severity": "critical" | "high" | "medium" | "low",
      "rule_id": "string or null",
      "description": "what is wrong",
      "location": "optional hint",
      "current_text": "exact offending text",
      "suggested_fix": "replacement text or instruction",
      "auto_fixable": true | false
    }
  ],
  "overall_assessment": "one or two sentences",
  "key_issues": ["short phrases"]
}

Return ONLY the JSON object, no other text.
"#;

pub const REGULATORY_PROMPT: &str = r#"
## Category: Regulatory

Look for statements that expose the publisher to legal or regulatory risk:
- Guaranteed outcomes or returns
- Missing mandatory disclaimers and risk warnings
- Unsubstantiated health, financial or performance claims
- Misleading comparisons

Severity follows the rule you cite. Legal exposure is never `low`.
"#;

pub const BRAND_PROMPT: &str = r#"
## Category: Brand

Look for departures from the brand guidelines in the rules:
- Tone of voice and forbidden vocabulary
- Product names, capitalization and trademarks
- Claims about competitors
"#;

pub const SEO_PROMPT: &str = r#"
## Category: SEO

Look for discoverability problems the rules describe:
- Missing or stuffed keywords
- Headings, titles and meta descriptions out of bounds
- Unclear anchor text
"#;

pub const GENERIC_CATEGORY_PROMPT: &str = r#"
## Category

Apply the rules below exactly as written.
"#;

fn category_prompt(category: &CategoryKey) -> &'static str {
    match category.as_str() {
        "regulatory" => REGULATORY_PROMPT,
        "brand" => BRAND_PROMPT,
        "seo" => SEO_PROMPT,
        _ => GENERIC_CATEGORY_PROMPT,
    }
}

/// Full system prompt for one category.
pub fn system_prompt(category: &CategoryKey) -> String {
    format!(
        "You are a specialist {} compliance agent.\n{}{}",
        category,
        BASE_SYSTEM_PROMPT,
        category_prompt(category)
    )
}

/// User message: the category's rules, then the content to check.
pub fn build_user_prompt(text: &str, category: &CategoryKey, rules: &[RuleDefinition]) -> String {
    let mut prompt = format!("## {} rules\n\n", category.as_str().to_uppercase());

    for rule in rules {
        prompt.push_str(&format!("- [{}] ({}) {}", rule.id, rule.severity, rule.text));
        if !rule.keywords.is_empty() {
            prompt.push_str(&format!(" Keywords: {}.", rule.keywords.join(", ")));
        }
        prompt.push('\n');
    }

    prompt.push_str("\n## Content\n\n");
    prompt.push_str(text);
    prompt.push_str("\n\nReport every violation of the rules above as JSON.");
    prompt
}

/// Correction appended after a reply that failed validation.
pub fn validation_feedback(error: &ValidationFailed) -> String {
    format!(
        "Previous response was invalid JSON or did not match schema. Error: {}. \
         Please CORRECT the JSON output.",
        error
    )
}
