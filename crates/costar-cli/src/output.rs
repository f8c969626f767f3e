use std::io::Write;

use chrono::NaiveDate;
use costar_core::{
    CandidatePair, CollaborationReport, EpisodeMatch, MediaType, Participant, ProgressEvent,
};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// Short status text for a progress event, as shown next to the spinner.
pub fn progress_message(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::ResolvingNames => "Searching... resolving names...".to_string(),
        ProgressEvent::GatheringCredits => "Searching... gathering credit lists...".to_string(),
        ProgressEvent::ComparingAppearances { candidates } => {
            format!("Searching... comparing appearances ({candidates} shared titles)...")
        }
        ProgressEvent::CheckingSeries {
            index,
            total,
            title,
        } => {
            format!(
                "Searching... checking tv episodes [{index}/{total}] {}...",
                truncate(title, 40)
            )
        }
        ProgressEvent::SeriesConfirmed { title, episode } => {
            format!(
                "Searching... {} confirmed in {}",
                truncate(title, 40),
                episode_code(episode)
            )
        }
        ProgressEvent::Finalizing => "Searching... cleaning results...".to_string(),
    }
}

/// Print a progress event as a single line (used where a spinner would
/// fight with user input).
pub fn print_progress(
    w: &mut dyn Write,
    event: &ProgressEvent,
    color: ColorMode,
) -> std::io::Result<()> {
    let msg = progress_message(event);
    if color.enabled() {
        writeln!(w, "{}", msg.dimmed())
    } else {
        writeln!(w, "{}", msg)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

/// `S02E05`
pub fn episode_code(ep: &EpisodeMatch) -> String {
    format!("S{:02}E{:02}", ep.season_number, ep.episode_number)
}

fn year_of(date: Option<NaiveDate>) -> String {
    use chrono::Datelike;
    date.map(|d| d.year().to_string())
        .unwrap_or_else(|| "—".to_string())
}

fn participant_line(p: &Participant) -> String {
    match p.birth_date {
        Some(born) => format!("{} (born {})", p.name, born),
        None => p.name.clone(),
    }
}

fn role_line(name: &str, role: Option<&str>, age: Option<i32>) -> String {
    let role = role.unwrap_or("—");
    match age {
        Some(age) => format!("{name}: {role} (age {age})"),
        None => format!("{name}: {role}"),
    }
}

/// Print the full collaboration report.
pub fn print_report(
    w: &mut dyn Write,
    report: &CollaborationReport,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    let header = format!(
        "{} & {}",
        participant_line(&report.person1),
        participant_line(&report.person2)
    );
    if color.enabled() {
        writeln!(w, "{}", header.bold())?;
    } else {
        writeln!(w, "{}", header)?;
    }

    if report.collaborations.is_empty() {
        writeln!(w)?;
        writeln!(w, "No shared movies or TV episodes found.")?;
        return Ok(());
    }

    print_summary(w, report, color)?;
    writeln!(w)?;

    for entry in &report.collaborations {
        print_entry(w, entry, report, color)?;
    }
    Ok(())
}

fn print_summary(
    w: &mut dyn Write,
    report: &CollaborationReport,
    color: ColorMode,
) -> std::io::Result<()> {
    let summary = &report.summary;
    let noun = if summary.count == 1 {
        "collaboration"
    } else {
        "collaborations"
    };
    let since = summary.since_last.as_deref().unwrap_or("—");
    let first = year_of(summary.first_collaboration);

    if color.enabled() {
        writeln!(
            w,
            "{} {} | {} {} | {} {}",
            summary.count.to_string().green().bold(),
            noun,
            "first:".dimmed(),
            first,
            "last:".dimmed(),
            since
        )?;
    } else {
        writeln!(
            w,
            "{} {} | first: {} | last: {}",
            summary.count, noun, first, since
        )?;
    }
    Ok(())
}

fn print_entry(
    w: &mut dyn Write,
    entry: &CandidatePair,
    report: &CollaborationReport,
    color: ColorMode,
) -> std::io::Result<()> {
    let year = year_of(entry.release_date);
    let kind = match entry.media_type {
        MediaType::Movie => "Movie",
        MediaType::Tv => "TV",
    };

    if color.enabled() {
        writeln!(
            w,
            "{:>4}  {} {}",
            year.yellow(),
            entry.title.cyan().bold(),
            format!("({kind})").dimmed()
        )?;
    } else {
        writeln!(w, "{:>4}  {} ({})", year, entry.title, kind)?;
    }

    if let Some(ref ep) = entry.episode {
        let mut line = episode_code(ep);
        if let Some(ref name) = ep.episode_name {
            line.push_str(&format!(" \"{name}\""));
        }
        if let Some(aired) = ep.air_date {
            line.push_str(&format!(", aired {aired}"));
        }
        if color.enabled() {
            writeln!(w, "      {}", line.magenta())?;
        } else {
            writeln!(w, "      {}", line)?;
        }
    }

    let roles = format!(
        "{} · {}",
        role_line(
            &report.person1.name,
            entry.person1_role.as_deref(),
            entry.person1_age
        ),
        role_line(
            &report.person2.name,
            entry.person2_role.as_deref(),
            entry.person2_age
        ),
    );
    if color.enabled() {
        writeln!(w, "      {}", roles.dimmed())?;
    } else {
        writeln!(w, "      {}", roles)?;
    }
    Ok(())
}

pub fn print_not_found(w: &mut dyn Write, name: &str, color: ColorMode) -> std::io::Result<()> {
    let msg = format!("Could not find one or both people (no match for \"{name}\"). Please check the spelling.");
    if color.enabled() {
        writeln!(w, "{}", msg.yellow())
    } else {
        writeln!(w, "{}", msg)
    }
}

pub fn print_failure(w: &mut dyn Write, color: ColorMode) -> std::io::Result<()> {
    let msg = "An error occurred. Please try again later.";
    if color.enabled() {
        writeln!(w, "{}", msg.red())
    } else {
        writeln!(w, "{}", msg)
    }
}
