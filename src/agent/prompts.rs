//! Message builders for every language model call the pipeline makes.

use crate::config::Portal;
use crate::llm::Message;

const DECISION_SCHEMA: &str = r#"{"action": "goto|click|stop|answer", "target": {"by": "url|text|href|id", "value": "<string>"}, "reason": "<string>", "confidence": <float 0..1>}"#;

/// Rewrite a (possibly non-English) question into an English keyword query.
pub fn query_rewrite(question: &str) -> Vec<Message> {
    let system = "You are an analyst helping search the API management console documentation.\n\
        Rules:\n\
        - Understand the question and produce one English keyword sentence suited for document search.\n\
        - Think internally; output only the final result.\n\
        - Output JSON only: {\"english_query\": \"...\"}";

    vec![
        Message::system(system),
        Message::user("게이트웨이 타임아웃 설정 방법 알려줘"),
        Message::assistant(r#"{"english_query":"API gateway timeout configuration guide"}"#),
        Message::user("Where do I change the API rate limit?"),
        Message::assistant(r#"{"english_query":"API rate limiting policy change steps"}"#),
        Message::user("JWT 인증 정책 설정하는 화면이 어디야?"),
        Message::assistant(r#"{"english_query":"JWT authentication policy configuration location"}"#),
        Message::user(format!(
            "Convert the question below into an English keyword sentence.\n\
             [question]\n{question}\n\
             Output JSON only: {{\"english_query\": \"...\"}}"
        )),
    ]
}

/// Detailed explanation plus table, restricted to the retrieved context.
pub fn summary(question: &str, context: &str, evidence: &str) -> Vec<Message> {
    let system = "You are an API management administrator and technical writer.\n\
        Rules:\n\
        - Reason over the evidence internally; do not include your reasoning in the output.\n\
        - Never state facts that are not present in the context.\n\
        - Answer in the language of the request.\n\
        - Output format:\n\
          1) a detailed step-by-step explanation, using lists where possible\n\
          2) a markdown table with a header row and at most 10 rows\n\
          3) an evidence section listing the chunks you used, verbatim\n\
        - Do not print section labels or preambles; start with the explanation itself.";

    vec![
        Message::system(system),
        Message::user(format!(
            "[request]\n{question}\n\n[context]\n{context}\n\n[evidence]\n{evidence}\n"
        )),
    ]
}

/// Pick the console portal and start path for a question.
pub fn portal_choice(question: &str, snippets: &str, portals: &[Portal]) -> Vec<Message> {
    let names: Vec<&str> = portals.iter().map(|p| p.name.as_str()).collect();
    let system = format!(
        "You navigate the API management portals. Given the user question and documentation \
         snippets, return JSON only.\n\
         Fields: portal ({}), path (for example /gateway, /api, /policy), reason",
        names.join("|")
    );

    vec![
        Message::system(system),
        Message::user(format!(
            "User question:\n{question}\n\nDocumentation snippets:\n{snippets}\n\n\
             Output JSON only:\n{{\"portal\":\"{}\",\"path\":\"/gateway\",\"reason\":\"...\"}}",
            names.first().copied().unwrap_or("console")
        )),
    ]
}

pub struct DecisionRequest<'a> {
    pub question: &'a str,
    pub current_url: &'a str,
    pub observation: &'a str,
    pub snippets: &'a str,
    pub step: usize,
    pub max_steps: usize,
    pub allow_answer: bool,
}

/// Next-action request for one loop iteration.
pub fn decision(req: &DecisionRequest) -> Vec<Message> {
    let system = format!(
        "You are a navigator for the API management console. Return the next action as JSON \
         only.\nSchema: {DECISION_SCHEMA}"
    );

    let mut rules = vec![
        "- When unsure, use action=stop.",
        "- For click, choose exactly one of by=text|href|id and set value exactly as shown on the page.",
        "- goto accepts absolute or relative URLs.",
    ];
    if req.allow_answer {
        rules.push("- Use action=answer once the current page holds what the user needs.");
    } else {
        rules.push("- action=answer is not allowed on this step; navigate first.");
    }

    vec![
        Message::system(system),
        Message::user(format!(
            "User question: {}\nCurrent URL: {}\nStep: {}/{}\n\n\
             Documentation snippets:\n{}\n\n\
             Page observation:\n{}\n\n\
             Rules:\n{}\n\
             Output JSON only.",
            req.question,
            req.current_url,
            req.step,
            req.max_steps,
            req.snippets,
            req.observation,
            rules.join("\n"),
        )),
    ]
}

pub struct AnswerRequest<'a> {
    pub question: &'a str,
    pub observation: &'a str,
    pub policy_items: &'a [String],
    pub trace_log: &'a str,
    pub snippets: &'a str,
}

/// Final answer from everything the loop saw.
pub fn answer(req: &AnswerRequest) -> Vec<Message> {
    let system = "You are an API management console expert. Answer the user's question using the \
        page you ended on, the pages you visited and the documentation snippets. \
        Cite the visited paths as evidence. Do not invent menu names that do not appear in the \
        observations or snippets. Answer in the language of the question.";

    let mut observation = req.observation.to_string();
    if !req.policy_items.is_empty() {
        observation.push_str("\n\nPolicy items on the page:\n");
        for item in req.policy_items {
            observation.push_str(&format!("- {item}\n"));
        }
    }

    vec![
        Message::system(system),
        Message::user(format!(
            "Question: {}\n\nFinal page observation:\n{}\n\nVisit log:\n{}\n\n\
             Documentation snippets:\n{}",
            req.question, observation, req.trace_log, req.snippets
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(allow_answer: bool) -> DecisionRequest<'static> {
        DecisionRequest {
            question: "How do I set a rate-limiting policy?",
            current_url: "https://console.example.com/gateway",
            observation: "# Gateway",
            snippets: "[a_chunk_0] rate limit",
            step: 1,
            max_steps: 5,
            allow_answer,
        }
    }

    #[test]
    fn test_first_step_forbids_answer() {
        let messages = decision(&request(false));
        let user = &messages.last().unwrap().content;
        assert!(user.contains("action=answer is not allowed"));
        assert!(user.contains("https://console.example.com/gateway"));
        assert!(messages[0].content.contains("goto|click|stop|answer"));
    }

    #[test]
    fn test_later_steps_allow_answer() {
        let messages = decision(&request(true));
        assert!(!messages[1].content.contains("not allowed"));
    }

    #[test]
    fn test_answer_includes_policy_items() {
        let items = vec!["Rate limiting policy".to_string()];
        let messages = answer(&AnswerRequest {
            question: "q",
            observation: "# Policies",
            policy_items: &items,
            trace_log: "1. /gateway/policies",
            snippets: "",
        });
        assert!(messages[1].content.contains("- Rate limiting policy"));
        assert!(messages[1].content.contains("/gateway/policies"));
    }

    #[test]
    fn test_query_rewrite_is_few_shot() {
        let messages = query_rewrite("정책 어디서 바꿔?");
        assert_eq!(messages.len(), 8);
        assert_eq!(messages[0].role, "system");
        assert!(messages[7].content.contains("정책 어디서 바꿔?"));
    }
}
