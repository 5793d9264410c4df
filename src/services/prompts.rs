use crate::models::field::{ExtractionStep, Field, RawFields, POSITIONS};
use crate::services::llm::ChatMessage;
use crate::services::taxonomy::{Taxonomy, INDUSTRY};

/// Extra key asked of the profile step to seed the expertise step.
pub const TOP_SKILLS_KEY: &str = "TopSkills";

const GROUNDING_RULES: &str = "You are an expert at analyzing technical resumes. \
Only report information that appears in the resume; never invent it. \
Keep answers as short as possible; a single word is best when it suffices. \
If a value is not present in the resume, use null.";

const DATE_RULES: &str = "For dates use the most specific form available: YYYY-MM-DD when the full date \
is known, YYYY-MM when only month and year are known, YYYY when only the year is known. \
For a current position use \"Present\" as the end date. Use null for an unknown date.";

const PHONE_RULES: &str = "Never put the same phone number in both Phone1 and Phone2, even if it is \
formatted differently. (123) 456-7890, 123-456-7890 and 1234567890 are the same number. \
If only one number is found, set Phone2 to null.";

const TITLE_RULES: &str = "Job titles describe what others call this person professionally; derive them \
from the work described at each position rather than copying the stated titles. Avoid overly general \
words such as Consultant, Solutions, Enterprise or IT. PrimaryTitle, SecondaryTitle and TertiaryTitle \
must all be present and different from each other.";

const HISTORY_RULES: &str = "List positions from most recent to oldest in MostRecent*, SecondMostRecent* \
and so on up to SeventhMostRecent*. Company is the employer's name only; Location is \"City, ST\" \
when available.";

const EXPERTISE_RULES: &str = "Skill1 through Skill10 are the candidate's strongest technical skills, most \
important first. Software languages, software applications and hardware must each be concrete \
products or languages actually used. YearsofExperience, AvgTenure and LengthinUS are numbers of \
years (one decimal place) estimated from the work history. ProjectTypes is a comma-separated list.";

fn industry_rules(taxonomy: &Taxonomy) -> String {
    let industries: Vec<&str> = taxonomy
        .entries()
        .iter()
        .filter(|e| e.category == INDUSTRY)
        .map(|e| e.canonical.as_str())
        .collect();
    format!(
        "PrimaryIndustry and SecondaryIndustry describe the industries of the companies and clients the \
candidate worked for and must both be chosen from this list: {}.",
        industries.join(", ")
    )
}

fn category_rules(taxonomy: &Taxonomy) -> String {
    format!(
        "PrimaryCategory and SecondaryCategory must be chosen from: {}.",
        taxonomy.skill_categories().join(", ")
    )
}

/// Closing instruction naming every key the response must contain.
pub fn output_contract(fields: impl Iterator<Item = Field>, extra_keys: &[&str]) -> String {
    let keys: Vec<&str> = fields.map(|f| -> &str { f.name() }).chain(extra_keys.iter().copied()).collect();
    format!(
        "Respond with a single JSON object and nothing else. It must contain exactly these keys: {}. \
Use null for any value you cannot find.",
        keys.join(", ")
    )
}

fn resume_message(resume_text: &str) -> ChatMessage {
    ChatMessage::user(format!("RESUME:\n{resume_text}"))
}

/// Step one: personal details, titles, work history and industries.
pub fn profile_messages(resume_text: &str, taxonomy: &Taxonomy, context: &str) -> Vec<ChatMessage> {
    let mut messages = vec![
        ChatMessage::system(GROUNDING_RULES),
        ChatMessage::system(DATE_RULES),
        ChatMessage::system(PHONE_RULES),
        ChatMessage::system(TITLE_RULES),
        ChatMessage::system(HISTORY_RULES),
        ChatMessage::system(industry_rules(taxonomy)),
    ];
    if !context.is_empty() {
        messages.push(ChatMessage::system(context));
    }
    messages.push(ChatMessage::system(format!(
        "Also return {TOP_SKILLS_KEY}: a comma-separated list of the five most prominent technical skills."
    )));
    messages.push(ChatMessage::system(output_contract(
        Field::in_step(ExtractionStep::Profile),
        &[TOP_SKILLS_KEY],
    )));
    messages.push(resume_message(resume_text));
    messages
}

/// Step two: skills, tools, categories and experience, informed by step one.
pub fn expertise_messages(
    resume_text: &str,
    taxonomy: &Taxonomy,
    context: &str,
    profile: &RawFields,
) -> Vec<ChatMessage> {
    let mut messages = vec![
        ChatMessage::system(GROUNDING_RULES),
        ChatMessage::system(EXPERTISE_RULES),
        ChatMessage::system(category_rules(taxonomy)),
    ];
    if !context.is_empty() {
        messages.push(ChatMessage::system(context));
    }
    let background = background(profile);
    if !background.is_empty() {
        messages.push(ChatMessage::system(background));
    }
    messages.push(ChatMessage::system(output_contract(
        Field::in_step(ExtractionStep::Expertise),
        &[],
    )));
    messages.push(resume_message(resume_text));
    messages
}

/// Both steps merged into one request.
pub fn unified_messages(resume_text: &str, taxonomy: &Taxonomy, context: &str) -> Vec<ChatMessage> {
    let mut messages = vec![
        ChatMessage::system(GROUNDING_RULES),
        ChatMessage::system(DATE_RULES),
        ChatMessage::system(PHONE_RULES),
        ChatMessage::system(TITLE_RULES),
        ChatMessage::system(HISTORY_RULES),
        ChatMessage::system(industry_rules(taxonomy)),
        ChatMessage::system(EXPERTISE_RULES),
        ChatMessage::system(category_rules(taxonomy)),
    ];
    if !context.is_empty() {
        messages.push(ChatMessage::system(context));
    }
    messages.push(ChatMessage::system(output_contract(
        Field::in_step(ExtractionStep::Profile).chain(Field::in_step(ExtractionStep::Expertise)),
        &[],
    )));
    messages.push(resume_message(resume_text));
    messages
}

/// Step-one findings rendered as background for step two.
fn background(profile: &RawFields) -> String {
    let mut lines = Vec::new();

    let titles: Vec<&str> = [Field::PrimaryTitle, Field::SecondaryTitle, Field::TertiaryTitle]
        .iter()
        .filter_map(|f| profile.get(*f))
        .collect();
    if !titles.is_empty() {
        lines.push(format!("Job titles: {}", titles.join(", ")));
    }

    let industries: Vec<&str> = [Field::PrimaryIndustry, Field::SecondaryIndustry]
        .iter()
        .filter_map(|f| profile.get(*f))
        .collect();
    if !industries.is_empty() {
        lines.push(format!("Industries: {}", industries.join(", ")));
    }

    if let Some(skills) = profile.extra(TOP_SKILLS_KEY) {
        lines.push(format!("Preliminary top skills: {skills}"));
    }

    let history: Vec<String> = POSITIONS
        .iter()
        .filter_map(|p| {
            let company = profile.get(p.company)?;
            let start = profile.get(p.start).unwrap_or("?");
            let end = profile.get(p.end).unwrap_or("?");
            Some(match profile.get(p.location) {
                Some(location) => format!("- {company} ({start} to {end}), {location}"),
                None => format!("- {company} ({start} to {end})"),
            })
        })
        .collect();
    if !history.is_empty() {
        lines.push(format!("Work history:\n{}", history.join("\n")));
    }

    if lines.is_empty() {
        return String::new();
    }
    format!("BACKGROUND FROM THE FIRST PASS:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::Role;

    fn taxonomy() -> Taxonomy {
        Taxonomy::builtin().unwrap()
    }

    #[test]
    fn test_resume_is_last_user_message() {
        let messages = unified_messages("Jane Doe\nJava developer", &taxonomy(), "");
        let last = messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert!(last.content.ends_with("Java developer"));
        assert!(messages[..messages.len() - 1].iter().all(|m| m.role == Role::System));
    }

    #[test]
    fn test_contract_lists_step_keys() {
        let messages = profile_messages("text", &taxonomy(), "");
        let contract = &messages[messages.len() - 2].content;
        assert!(contract.contains("MostRecentCompany"));
        assert!(contract.contains(TOP_SKILLS_KEY));
        assert!(!contract.contains("Skill1,"));
    }

    #[test]
    fn test_expertise_step_carries_background() {
        let mut profile = RawFields::new();
        profile.insert(Field::PrimaryTitle, "Backend Engineer");
        profile.insert(Field::MostRecentCompany, "Acme");
        profile.insert(Field::MostRecentStartDate, "2020-01");
        profile.insert(Field::MostRecentEndDate, "Present");
        profile.insert_extra(TOP_SKILLS_KEY, "Java, SQL");

        let messages = expertise_messages("text", &taxonomy(), "", &profile);
        let background = messages
            .iter()
            .find(|m| m.content.starts_with("BACKGROUND"))
            .unwrap();
        assert!(background.content.contains("Job titles: Backend Engineer"));
        assert!(background.content.contains("- Acme (2020-01 to Present)"));
        assert!(background.content.contains("Preliminary top skills: Java, SQL"));
    }

    #[test]
    fn test_taxonomy_context_is_included_when_present() {
        let context = "SKILLS TAXONOMY REFERENCE:\n- Software Development: Java\n";
        let messages = unified_messages("text", &taxonomy(), context);
        assert!(messages.iter().any(|m| m.content == context));
    }
}
