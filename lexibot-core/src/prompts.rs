//! Prompt construction for word generation and tutoring.

/// Base system prompt shared by all backend calls.
pub fn system_prompt() -> String {
    "You are an expert vocabulary tutor helping users expand their English \
     vocabulary. Maintain an encouraging and educational tone. Keep \
     conversations focused on vocabulary learning."
        .to_string()
}

fn join_or_none(words: &[String]) -> String {
    if words.is_empty() {
        "None".to_string()
    } else {
        words.join(", ")
    }
}

/// Build the word-generation prompt.
///
/// `existing` is the hard exclusion list; the known/learning split calibrates
/// difficulty (new words should sit at or above the level of words the user
/// had to learn); `theme` optionally constrains the topic.
pub fn word_generation_prompt(
    existing: &[String],
    known: &[String],
    learning: &[String],
    theme: Option<&str>,
) -> String {
    let theme_instruction = match theme {
        Some(theme) => format!("\nThe word should be related to the theme: {}", theme),
        None => String::new(),
    };

    format!(
        r#"You are a vocabulary tutor helping a user learn new English words. Your task is to generate a **new** vocabulary word for the user to learn.

EXISTING WORDS (DO NOT REPEAT ANY OF THESE):
{existing}

WORDS THE USER ALREADY KNEW:
{known}

WORDS THE USER HAD TO LEARN:
{learning}

DIFFICULTY GUIDANCE:
Generate words of the same difficulty level that the user had to learn. Should be above the level of words the user already knew.
{theme_instruction}

Generate a vocabulary word that:
1. Is NOT in the existing words list
2. Is appropriate for the user's current level
3. Is a real English word that would be useful to know
4. Is not overly obscure or archaic
5. Give meanings from trustable sources only

Respond ONLY with a JSON object in this exact format:
{{
    "word": "the_vocabulary_word",
    "meanings": [
        "First or most common meaning/definition of the word",
        "Further meanings/definitions if applicable"
    ],
    "examples": [
        "An example sentence using the word in context.",
        "Another example sentence showing different usage."
    ]
}}

Strictly no markdown code block markers in JSON output.

Make sure the examples are clear and help illustrate the word's meaning."#,
        existing = join_or_none(existing),
        known = join_or_none(known),
        learning = join_or_none(learning),
        theme_instruction = theme_instruction,
    )
}

/// Build the tutoring prompt for a follow-up message in a word's thread.
pub fn tutor_prompt(
    thread_context: &str,
    user_message: &str,
    word: &str,
    theme: Option<&str>,
) -> String {
    let theme_note = match theme {
        Some(theme) => format!(
            "\nThe user is currently studying words around the theme: {}.\n",
            theme
        ),
        None => String::new(),
    };

    format!(
        r#"You are a helpful vocabulary tutor engaged in a conversation about learning a new vocabulary word, "{word}".
{theme_note}
Here is the conversation history:
{thread_context}

The user just said:
{user_message}

As a vocabulary tutor, provide a helpful, encouraging and educational response. Consider:

1. If they're asking a question about the word, answer it clearly
2. If they're trying to use the word in a sentence, evaluate if it's correct and provide feedback
3. If they need more examples or clarification, provide them
4. If they seem confused, help clarify the meaning and usage
5. If they're going off-topic, gently redirect to vocabulary learning

Keep your response concise (2-3 sentences max), encouraging, and educational.
If the user successfully used the word correctly in a sentence, congratulate them.

Respond naturally as a tutor would, helping the user understand and learn the vocabulary word effectively.
Always end the response with: "Let me know if you have more questions. If you want a new word, just reply with a '1'.""#,
        word = word,
        theme_note = theme_note,
        thread_context = thread_context,
        user_message = user_message,
    )
}
