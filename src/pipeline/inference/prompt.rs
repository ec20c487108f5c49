use crate::pipeline::state::{Document, TaskResult};

pub const METADATA_SYSTEM_PROMPT: &str = "\
You are an assistant specialized in extracting structured information from files.
Analyze the file content and describe the file.
Respond with a single JSON object:
{\"purpose\": \"<what the document is and why it exists>\", \
\"possible_use_cases\": \"<audit questions this document can help answer>\"}";

pub const TASK_PARSER_SYSTEM_PROMPT: &str = "\
Given a block of audit tasks, split it into individual tasks.
Do not change the wording of any task; only separate them and drop list numbering.
Respond with a single JSON object: {\"tasks\": [\"<task>\", ...]}";

pub const RELEVANCE_SYSTEM_PROMPT: &str = "\
You check whether a set of audit tasks is relevant to SOX and financial standards, \
for example payroll, accounts payable, accounts receivable, or general ledger controls.
You will receive the tasks.
Respond with a single JSON object: {\"is_relevant\": true|false, \"reason\": \"<short reason>\"}";

pub const SELECTION_SYSTEM_PROMPT: &str = "\
You identify which documents are essential for executing a specific task.

You will receive a task description and a numbered list of documents (file name, purpose, \
possible use cases and full content).

Return only the documents that are necessary for the successful execution of the task. \
Do not select documents based on general relevance; select them only if they directly \
enable the task to be completed or answered. Examine the file name first; if it is not \
sufficient to decide, analyze the content. Exclude any document that does not clearly \
contribute, even if it is somewhat related.

Respond with a single JSON object: {\"docs\": [\"<exact file name>\", ...]}. \
Use an empty list when no document is required.";

pub const EXECUTION_SYSTEM_PROMPT: &str = "\
You execute an audit task using only the provided documents.

Analyze the task, review the documents carefully and execute the task with precision based \
only on the available information. If there are discrepancies, missing data or contradictions \
in the documents that prevent the task from being completed, the verdict is FAIL and the \
output explains why. Never guess.

In the output give a detailed, structured answer with numerical values, row numbers where \
applicable, and observations, and name the document files you used.

Respond with a single JSON object:
{\"output\": \"<answer>\", \"verdict\": \"PASS\"|\"FAIL\", \"evidence_files\": [\"<file name>\", ...]}";

pub const REFLECTION_SYSTEM_PROMPT: &str = "\
You reflect on the results of executed audit tasks.
You will receive each task with its output and verdict.
List the tasks that were not executed successfully and, for each, what evidence or \
reasoning was missing. Answer in plain text.";

pub const REPORT_SYSTEM_PROMPT: &str = "\
You report the result of one audit task in a structured format:

Task: <task>
File Name: <file names of the documents used>
Output: <details of the task output including numerical values, row numbers and observations>
Pass or Fail: <PASS or FAIL>

Respond with a single JSON object: {\"output\": \"<the formatted section>\"}";

pub const VISION_SYSTEM_PROMPT: &str = "\
You extract structured information from images. Return only the extracted content: \
no commentary, explanations, or greetings.";

pub const VISION_USER_PROMPT: &str = "\
Extract all content from this image. If the image contains a table, prefix each row with a \
label such as \"Row 1:\", \"Row 2:\" and so on. Preserve any introductory or header text \
exactly as it appears.";

/// Prompt for `extract_metadata`.
pub fn build_metadata_prompt(name: &str, content: &str) -> String {
    format!("File Name: {name}\nFile Content: \n{content}")
}

/// Full view of every document, used by document selection.
pub fn build_selection_view(documents: &[Document]) -> String {
    let mut view = String::new();
    for (i, doc) in documents.iter().enumerate() {
        view.push_str(&format!(
            "\n\n{}. File Name: {}\nFile Purpose: {}\nFile Possible Use Cases: {}\nFile Content: \n<start document_content of {}>\n{}\n<end document_content of {}>\n\n",
            i + 1,
            doc.name,
            doc.purpose,
            doc.usage_notes,
            doc.name,
            doc.content,
            doc.name,
        ));
    }
    view
}

pub fn build_selection_prompt(task: &str, documents: &[Document]) -> String {
    format!(
        "Task: {task}\n\nDocuments to map: {}",
        build_selection_view(documents)
    )
}

/// View of the bound documents only, used by task execution.
pub fn build_execution_view(documents: &[&Document]) -> String {
    let mut view = String::new();
    for (i, doc) in documents.iter().enumerate() {
        view.push_str(&format!(
            "\n\n{}. File Name: {}\nFile Content: \n<document_content {}>\n{}\n</document_content {}>\n\n",
            i + 1,
            doc.name,
            doc.name,
            doc.content,
            doc.name,
        ));
    }
    view
}

pub fn build_execution_prompt(
    task: &str,
    documents: &[&Document],
    reflection_notes: Option<&str>,
) -> String {
    let mut prompt = format!("Task: {task}\nDocuments: \n{}", build_execution_view(documents));
    if let Some(notes) = reflection_notes.filter(|n| !n.trim().is_empty()) {
        prompt.push_str("\nReviewer notes from the previous attempt:\n");
        prompt.push_str(notes);
        prompt.push('\n');
    }
    prompt
}

pub fn build_reflection_prompt(results: &[TaskResult]) -> String {
    let mut prompt = String::new();
    for (i, r) in results.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. Task: {}\nOutput: {}\nPass or Fail: {}\n\n",
            i + 1,
            r.task,
            r.output,
            r.verdict
        ));
    }
    prompt
}

pub fn build_report_prompt(result: &TaskResult) -> String {
    format!(
        "Task: {}\nFile Names: {}\nOutput: {}\nPass or Fail: {}\n\n",
        result.task,
        result.evidence_files.join(", "),
        result.output,
        result.verdict
    )
}
