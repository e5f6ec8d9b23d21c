//! Windows HPC Server job descriptions
//!
//! Same lifecycle as the script schedulers, but the artifact is an XML job
//! with one `<Task>` per process. Every value substituted into the XML is
//! escaped here, so templates can use plain `{name}` placeholders.

use crate::config::{ArgumentList, Role, TemplateContext, WinHpcOptions};

pub const DEFAULT_TEMPLATE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Job xmlns="http://schemas.microsoft.com/HPCS2008R2/scheduler/" Version="3.000" Name="{job_name}" Project="{project}" Priority="{priority}" IsExclusive="false" RunUntilCanceled="false"{user_attribute}>
  <Dependencies />
  <Tasks>
{tasks}
  </Tasks>
</Job>
"#;

/// Escape text for use inside XML attributes and element content
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Join arguments into a Windows command line
pub fn windows_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains([' ', '\t', '"']) {
                format!("\"{}\"", arg.replace('"', "\\\""))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `<Task>` elements for `count` identical processes
pub fn tasks(job_name: &str, work_dir: &str, args: &ArgumentList, count: usize) -> String {
    let command_line = xml_escape(&windows_join(args));
    let work_dir = xml_escape(work_dir);

    (0..count)
        .map(|i| {
            format!(
                r#"    <Task Name="{}-{}" MinCores="1" MaxCores="1" WorkDirectory="{}" CommandLine="{}" />"#,
                xml_escape(job_name),
                i,
                work_dir,
                command_line
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Template variables for a job description.
///
/// Values that already exist in `ctx` are escaped in place.
pub fn extend_context(
    ctx: &mut TemplateContext,
    opts: &WinHpcOptions,
    role: Role,
    args: &ArgumentList,
    n: usize,
) {
    let count = match role {
        Role::Controller => 1,
        Role::Engines => n,
    };
    let task_xml = tasks(
        ctx.get("job_name").unwrap_or_default(),
        ctx.get("work_dir").unwrap_or_default(),
        args,
        count,
    );

    for value in ctx.vars.values_mut() {
        *value = xml_escape(value);
    }

    ctx.set("tasks", task_xml);
    ctx.set("project", xml_escape(&opts.project));
    ctx.set("priority", xml_escape(&opts.priority));
    ctx.set(
        "user_attribute",
        opts.username
            .as_deref()
            .map(|u| format!(r#" UserName="{}""#, xml_escape(u)))
            .unwrap_or_default(),
    );
}
