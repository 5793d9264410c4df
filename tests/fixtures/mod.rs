//! Resumes, model replies and batch artifact lines

#![allow(dead_code)]

use serde_json::json;

pub const ACME_RESUME: &str = "\
# Jane Doe
jane.doe@example.com | (512) 555-0142 | Austin, TX

## Experience
**Senior Software Engineer**, Acme Corp, Austin, TX. 2020-01 to Present
- Built order services in Java and Spring Boot on AWS
- Ran PostgreSQL clusters and Kubernetes deployments

**Software Engineer**, Initech, Dallas, TX. 2016-06 to 2019-12
- Maintained billing software in Java and SQL
";

/// One-step reply for [`ACME_RESUME`].
pub fn acme_reply() -> String {
    json!({
        "FirstName": "Jane",
        "LastName": "Doe",
        "Email": "jane.doe@example.com",
        "Phone1": "(512) 555-0142",
        "City": "Austin",
        "State": "TX",
        "PrimaryTitle": "Senior Software Engineer",
        "MostRecentCompany": "Acme",
        "MostRecentStartDate": "2020-01-01",
        "MostRecentEndDate": null,
        "MostRecentLocation": "Austin, TX",
        "SecondMostRecentCompany": "Initech",
        "SecondMostRecentStartDate": "2016-06",
        "SecondMostRecentEndDate": "2019-12",
        "SecondMostRecentLocation": "Dallas, TX",
        "PrimarySoftwareLanguage": "Java",
        "Skill1": "Java",
        "Skill2": "PostgreSQL",
        "PrimaryIndustry": "Information Technology",
        "YearsofExperience": 9
    })
    .to_string()
}

/// A minimal reply naming only the current employer.
pub fn short_reply(company: &str) -> String {
    json!({
        "MostRecentCompany": company,
        "MostRecentStartDate": "2021-03",
        "MostRecentEndDate": "Present",
        "PrimarySoftwareLanguage": "Python"
    })
    .to_string()
}

/// A successful batch output line carrying `content` as the model reply.
pub fn output_line(user_id: i64, content: &str) -> String {
    json!({
        "id": format!("batch_req_{user_id}"),
        "custom_id": format!("resume-{user_id}"),
        "response": {
            "status_code": 200,
            "body": {
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": content },
                    "finish_reason": "stop"
                }]
            }
        },
        "error": null
    })
    .to_string()
}

/// A line from the service's error artifact.
pub fn error_line(user_id: i64, code: &str, message: &str) -> String {
    json!({
        "id": format!("batch_req_{user_id}"),
        "custom_id": format!("resume-{user_id}"),
        "response": null,
        "error": { "code": code, "message": message }
    })
    .to_string()
}

/// `line` cut off partway through.
pub fn truncated(line: &str) -> String {
    line[..line.len() / 2].to_string()
}

pub fn jsonl(lines: &[String]) -> String {
    lines.join("\n") + "\n"
}
