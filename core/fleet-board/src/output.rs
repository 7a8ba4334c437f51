use chrono::SecondsFormat;
use fleet_core::BoardProject;

pub fn line(project: &BoardProject) -> String {
    format!(
        "id={}  stage={}  title={}",
        project.id, project.stage, project.title
    )
}

pub fn detail(project: &BoardProject) -> String {
    let sessions = project.session_ids.join(",");
    let prs = project
        .pr_numbers
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{}  desc={}  sessions={}  prs={}  tags={}  created={} updated={}",
        line(project),
        project.description,
        sessions,
        prs,
        project.tags.join(","),
        project.created.to_rfc3339_opts(SecondsFormat::Secs, true),
        project.updated.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}
