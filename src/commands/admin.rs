//! One-shot operator commands

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Subcommand;

use mawaqit::groups::PolicyUpdate;
use mawaqit::models::GroupId;
use mawaqit::resolver::TimesLookup;
use mawaqit::utils::format_duration;

use super::Services;

#[derive(Debug, Subcommand)]
pub enum GroupAction {
    /// Register or reactivate a group
    Add {
        id: i64,
        #[arg(long)]
        title: Option<String>,
        /// IANA timezone; defaults to the configured one
        #[arg(long)]
        timezone: Option<String>,
    },
    /// Deactivate a group
    Remove { id: i64 },
    /// Print one group's policy and last dispatch
    Show { id: i64 },
    /// List active groups
    List,
    /// Change a group's settings
    Set {
        id: i64,
        #[arg(long)]
        lead: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
        /// Interval remembrance in minutes; 0 turns it off
        #[arg(long)]
        interval: Option<u32>,
        #[arg(long)]
        pre_alert: Option<bool>,
        #[arg(long)]
        prayer_start: Option<bool>,
        #[arg(long)]
        delayed_action: Option<bool>,
        #[arg(long)]
        periodic: Option<bool>,
    },
}

/// Resolve one day and print it
pub async fn fetch(services: &Services, date: Option<NaiveDate>) -> Result<()> {
    let now = Utc::now();
    let date = date.unwrap_or_else(|| {
        let tz = mawaqit::utils::parse_timezone(&services.config.scheduler.default_timezone)
            .unwrap_or(chrono_tz::UTC);
        now.with_timezone(&tz).date_naive()
    });

    let resolved = services.resolver.times_for(date, now).await?;
    let times = &resolved.times;

    println!("Prayer times for {} ({})", times.date, services.config.sources.location.city);
    println!("{:-<40}", "");
    for (prayer, time) in times.iter() {
        println!("  {:<8} {}", prayer.as_str(), time.format("%H:%M"));
    }
    println!("{:-<40}", "");
    println!("  Source:  {}", times.source);
    println!("  Fetched: {}", times.fetched_at.to_rfc3339());
    if resolved.stale {
        println!("  STALE: expired at {}", times.expires_at.to_rfc3339());
    }

    Ok(())
}

/// Print a group's upcoming events
pub async fn schedule(services: &Services, group: i64, at: Option<DateTime<Utc>>) -> Result<()> {
    let group = GroupId(group);
    let now = at.unwrap_or_else(Utc::now);

    let policy = services
        .groups
        .policy(group)?
        .with_context(|| format!("group {group} is not registered"))?;

    let events = services
        .computer
        .next_events(now, &policy, services.resolver.as_ref())
        .await?;

    println!("Upcoming events for group {group} ({})", policy.timezone);
    println!("{:-<72}", "");
    for event in &events {
        println!(
            "  {}  in {:>8}  {:<15} {}{}",
            event.local_time.format("%Y-%m-%d %H:%M"),
            format_duration(event.fire_at - now),
            event.class,
            event.occurrence,
            if event.stale { "  (stale)" } else { "" }
        );
    }
    if events.is_empty() {
        println!("  (none)");
    }

    Ok(())
}

/// Print the health snapshot as JSON
pub async fn health(services: &Services) -> Result<()> {
    let report = services.health.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Purge expired cache entries and old ledger rows once
pub async fn purge(services: &Services) -> Result<()> {
    let removed = services.cache.purge_expired().await?;
    let retention = chrono::Duration::days(services.config.scheduler.ledger_retention_days);
    let pruned = services.groups.prune_ledger(Utc::now() - retention)?;

    println!("Purged {removed} expired cache entries and {pruned} ledger rows");
    Ok(())
}

pub async fn group(services: &Services, action: GroupAction) -> Result<()> {
    let groups = &services.groups;

    match action {
        GroupAction::Add { id, title, timezone } => {
            let mut policy = groups.add_group(GroupId(id), title)?;
            if let Some(timezone) = timezone {
                let update = PolicyUpdate {
                    timezone: Some(timezone),
                    ..Default::default()
                };
                policy = groups.update_policy(GroupId(id), &update)?;
            }
            println!("{}", serde_json::to_string_pretty(&policy)?);
        }
        GroupAction::Remove { id } => {
            if groups.remove_group(GroupId(id))? {
                println!("Group {id} deactivated");
            } else {
                println!("Group {id} is not registered");
            }
        }
        GroupAction::Show { id } => {
            let policy = groups
                .policy(GroupId(id))?
                .with_context(|| format!("group {id} is not registered"))?;
            println!("{}", serde_json::to_string_pretty(&policy)?);
            if let Some(last) = groups.last_dispatched(GroupId(id))? {
                println!("Last dispatch: {} at {}", last.key, last.recorded_at.to_rfc3339());
            }
        }
        GroupAction::List => {
            for policy in groups.active_policies()? {
                println!(
                    "{:>14}  {:<20} {}",
                    policy.group,
                    policy.timezone,
                    policy.title.as_deref().unwrap_or("-")
                );
            }
        }
        GroupAction::Set {
            id,
            lead,
            offset,
            interval,
            pre_alert,
            prayer_start,
            delayed_action,
            periodic,
        } => {
            let update = PolicyUpdate {
                lead_minutes: lead,
                offset_minutes: offset,
                periodic_interval_minutes: interval.map(|m| (m > 0).then_some(m)),
                pre_alert,
                prayer_start,
                delayed_action,
                periodic,
                ..Default::default()
            };
            let policy = groups.update_policy(GroupId(id), &update)?;
            println!("{}", serde_json::to_string_pretty(&policy)?);
        }
    }

    Ok(())
}
