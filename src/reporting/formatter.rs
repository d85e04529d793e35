use crate::models::Severity;
use crate::output::ResultEvent;

pub fn format_result_markdown(event: &ResultEvent) -> String {
    let mut out = format!(
        "### {} ({})\n\n**Severity:** {}\n**Matched at:** `{}`\n",
        if event.info.name.is_empty() { &event.template_id } else { &event.info.name },
        event.template_id,
        event.info.severity,
        event.matched_at,
    );
    if let Some(name) = event.matcher_name.as_ref().or(event.extractor_name.as_ref()) {
        out.push_str(&format!("**Rule:** {}\n", name));
    }
    if let Some(description) = &event.info.description {
        out.push_str(&format!("\n{}\n", description.trim()));
    }
    if !event.extracted_results.is_empty() {
        out.push_str(&format!("\n**Extracted:**\n```\n{}\n```\n", event.extracted_results.join("\n")));
    }
    if let Some(interaction) = &event.interaction {
        out.push_str(&format!(
            "\n**Interaction:** {} from {}\n",
            interaction.protocol, interaction.remote_address
        ));
    }
    out
}

pub fn format_executive_summary(events: &[ResultEvent]) -> String {
    let count = |severity: Severity| events.iter().filter(|e| e.info.severity == severity).count();

    format!(
        "## Executive Summary\n\n| Severity | Count |\n|---|---|\n| Critical | {} |\n| High | {} |\n| Medium | {} |\n| Low | {} |\n| Info | {} |\n| Unknown | {} |\n| **Total** | **{}** |\n",
        count(Severity::Critical),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low),
        count(Severity::Info),
        count(Severity::Unknown),
        events.len()
    )
}
