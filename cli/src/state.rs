use std::io::stdout;

use clap::{self, Args};
use serde::Serialize;

use harrier::adb::ExecAdb;
use harrier::config::HarnessConfig;
use harrier::device::{AdbDevice, Device, Owner, UserInfo};
use harrier::precondition::UserId;
use harrier::Context;

#[derive(Args)]
pub struct State {
    /// Output JSON instead of text
    #[arg(short, long)]
    json: bool,
}

/// The parts of the device preconditions care about
#[derive(Serialize)]
struct DeviceSnapshot {
    current_user: UserId,
    users: Vec<UserInfo>,
    owners: Vec<Owner>,
}

impl DeviceSnapshot {
    fn take(device: &dyn Device) -> harrier::Result<Self> {
        Ok(Self {
            current_user: device.current_user()?,
            users: device.users()?,
            owners: device.owners()?,
        })
    }

    fn print(&self) {
        println!("Users:");
        for u in &self.users {
            let mut notes = Vec::new();
            if u.id == self.current_user {
                notes.push(String::from("current"));
            }
            if let Some(parent) = u.parent {
                notes.push(format!("profile of {}", parent));
            }
            if notes.is_empty() {
                println!("  {}: {} ({})", u.id, u.name, u.user_type);
            } else {
                println!(
                    "  {}: {} ({}) [{}]",
                    u.id,
                    u.name,
                    u.user_type,
                    notes.join(", ")
                );
            }
        }

        if self.owners.is_empty() {
            println!("No device or profile owners");
            return;
        }
        println!("Owners:");
        for o in &self.owners {
            println!("  {} for user {}: {}", o.kind, o.user, o.component);
        }
    }
}

impl State {
    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        let cfg = HarnessConfig::load(ctx)?;
        let adb = ExecAdb::new(ctx, &cfg.device)?;
        let device = AdbDevice::new(Box::new(adb), &cfg.retry);

        let snapshot = DeviceSnapshot::take(&device)?;
        if self.json {
            serde_json::to_writer(stdout(), &snapshot)?;
        } else {
            snapshot.print();
        }
        Ok(())
    }
}
