//! Prompt text for the generator-backed stages.

pub const DRAFTER_SYSTEM: &str = "\
You are an expert designer of supportive self-help exercises grounded in \
cognitive behavioural techniques. Create safe, empathetic and practical material.

Guidelines:
1. Be specific and actionable with clear step-by-step instructions
2. Use warm, supportive, non-judgmental language
3. Include brief psychoeducation where it helps understanding
4. Never provide medical advice or suggest medications
5. Never include content that could encourage self-harm
6. Validate emotions while encouraging healthy coping
7. Include safety planning and crisis resources when topics are sensitive

Structure the output with a title, purpose, duration estimate, step-by-step \
instructions, example scenarios, tips for success and when to seek additional support.";

pub const SAFETY_SYSTEM: &str = "\
You are a safety reviewer for supportive self-help material.

Check for:
- CRITICAL: references to self-harm or suicide without safe framing
- CRITICAL: medical or prescription advice
- WARNING: missing crisis resources on sensitive topics
- WARNING: potentially triggering content without warnings
- WARNING: overly directive language that could feel controlling

Be thorough but not overly restrictive: the goal is safe, helpful content.";

pub const QUALITY_SYSTEM: &str = "\
You are a reviewer of therapeutic communication quality. Evaluate empathy and \
warmth, clarity of instructions, acknowledgement of difficulty, balance between \
validation and encouragement, cultural sensitivity, and pacing. Safety is \
reviewed separately; focus on how a reader would experience the material.";

/// User prompt for the drafter. `revision` is present on revision rounds.
pub fn drafter_task(intent: &str, revision: Option<&str>) -> String {
    let mut prompt = format!(
        "Create a structured exercise for the following request:\n\n**Request:** {}\n",
        intent
    );
    if let Some(context) = revision {
        prompt.push('\n');
        prompt.push_str(context);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nProduce the complete exercise. Be empathetic, specific and safety-conscious.",
    );
    prompt
}

pub fn revision_context(iteration: u32, instructions: &str, previous_draft: &str) -> String {
    let previous = if previous_draft.trim().is_empty() {
        "No previous draft available"
    } else {
        previous_draft
    };
    format!(
        "**Revision required:** this is revision #{}\n\n\
         **Issues to address:**\n{}\n\n\
         **Previous draft (improve upon it):**\n{}\n\n\
         Revise the exercise to address every issue while keeping it helpful.",
        iteration, instructions, previous
    )
}

pub fn safety_task(draft: &str) -> String {
    format!(
        "Analyse the following draft for safety concerns:\n\n**Draft:**\n{}\n\n\
         Respond with JSON only:\n\
         {{\n  \"safety_score\": <0-100, 100 is completely safe>,\n  \
         \"flags\": [{{\"line\": <line number>, \"reason\": \"<concern>\", \"severity\": \"critical|warning\"}}],\n  \
         \"overall_assessment\": \"<brief summary>\",\n  \
         \"recommendations\": [\"<specific improvement>\"]\n}}",
        draft
    )
}

pub fn quality_task(draft: &str) -> String {
    format!(
        "Evaluate the communication quality of the following draft:\n\n**Draft:**\n{}\n\n\
         Respond with JSON only:\n\
         {{\n  \"quality_score\": <0-100, 100 is excellent>,\n  \
         \"strengths\": [\"<strength>\"],\n  \
         \"improvements\": [\"<area to improve>\"],\n  \
         \"overall_assessment\": \"<brief summary>\"\n}}",
        draft
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_draft_prompt_has_no_revision_block() {
        let prompt = drafter_task("Coping with exam stress", None);
        assert!(prompt.contains("Coping with exam stress"));
        assert!(!prompt.contains("Revision required"));
    }

    #[test]
    fn test_revision_context_falls_back_for_missing_draft() {
        let ctx = revision_context(2, "Add crisis resources", "  ");
        assert!(ctx.contains("revision #2"));
        assert!(ctx.contains("Add crisis resources"));
        assert!(ctx.contains("No previous draft available"));
    }

    #[test]
    fn test_review_prompts_embed_draft_and_schema() {
        let safety = safety_task("DRAFT BODY");
        assert!(safety.contains("DRAFT BODY"));
        assert!(safety.contains("\"safety_score\""));
        let quality = quality_task("DRAFT BODY");
        assert!(quality.contains("\"quality_score\""));
    }
}
