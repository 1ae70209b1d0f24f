use super::{print_json, print_nodes};
use colored::Colorize;
use fleetlab_backend::{Fleet, InventoryItem, InventoryRequest, InventorySnapshot};

pub fn build_request(owner: Option<String>, items: &[String]) -> anyhow::Result<InventoryRequest> {
    let mut request = if items.is_empty() {
        InventoryRequest::all()
    } else {
        items
            .iter()
            .map(|item| item.parse::<InventoryItem>())
            .try_fold(InventoryRequest::new(), |request, item| {
                item.map(|item| request.item(item))
            })?
    };
    request = request.owner(owner);
    Ok(request)
}

pub async fn handle(
    fleet: &Fleet,
    owner: Option<String>,
    items: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let request = build_request(owner, items)?;
    let snapshot = fleet.inventory(&request).await?;

    if json {
        return print_json(&snapshot);
    }

    for item in &request.items {
        print_item(&snapshot, *item);
    }
    Ok(())
}

fn heading(title: &str) {
    println!();
    println!("{}", title.bold().underline());
}

fn print_item(snapshot: &InventorySnapshot, item: InventoryItem) {
    match item {
        InventoryItem::Clusters => {
            heading("Clusters");
            print_nodes(&snapshot.clusters);
        }
        InventoryItem::Clients => {
            heading("Clients");
            print_nodes(&snapshot.clients);
        }
        InventoryItem::Templates => {
            heading("Templates");
            super::template::print_templates(&snapshot.templates);
        }
        InventoryItem::FirewallRules => {
            heading("Firewall rules");
            if snapshot.firewall_rules.is_empty() {
                println!("{}", "none".dimmed());
            }
            for rule in &snapshot.firewall_rules {
                println!(
                    "{:<32} {:<24} allow {:<24} from {}",
                    rule.name.cyan(),
                    rule.network,
                    rule.allow_ports.join(","),
                    rule.source_ranges.join(",").dimmed()
                );
            }
        }
        InventoryItem::Subnets => {
            heading("Subnets");
            if snapshot.subnets.is_empty() {
                println!("{}", "none".dimmed());
            }
            for subnet in &snapshot.subnets {
                let default = if subnet.is_zone_default { "default" } else { "" };
                println!(
                    "{:<28} {:<20} {:<24} {:<16} {}",
                    subnet.id.cyan(),
                    subnet.cidr,
                    subnet.network_name,
                    subnet.zone,
                    default.dimmed()
                );
            }
        }
        InventoryItem::Volumes => {
            heading("Volumes");
            if snapshot.volumes.is_empty() {
                println!("{}", "none".dimmed());
            }
            for volume in &snapshot.volumes {
                let size = volume
                    .size_bytes
                    .map(|b| format!("{} GiB", b >> 30))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<28} {:<16} {:<10} {:<12} {}",
                    volume.name.cyan(),
                    volume.zone,
                    size,
                    volume.owner,
                    volume.expires.to_string().dimmed()
                );
            }
        }
        InventoryItem::ExpirySystem => {
            heading("Expiry system");
            super::expiry::print_records(&snapshot.expiry_system);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_defaults_to_everything() {
        let request = build_request(None, &[]).unwrap();
        assert_eq!(request.items.len(), InventoryItem::ALL.len());
        assert!(request.required.is_empty());
    }

    #[test]
    fn test_build_request_items() {
        let items = vec!["clusters".to_string(), "volumes".to_string()];
        let request = build_request(Some("bob".to_string()), &items).unwrap();
        assert_eq!(request.items.len(), 2);
        assert!(request.items.contains(&InventoryItem::Volumes));
        assert_eq!(request.owner.as_deref(), Some("bob"));

        let bad = vec!["buckets".to_string()];
        assert!(build_request(None, &bad).is_err());
    }
}
