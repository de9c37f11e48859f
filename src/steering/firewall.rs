//! nftables table shared by the chain compiler and the DNS bypass tracker
//!
//! The compiler only touches the `vpn`/`wan` chain programs and the tracker
//! only touches the `bypass_domain_ip` set.

use crate::platform::{Effector, PlatformError, SystemCommand};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

pub const TABLE: &str = "shieldlink";
pub const DOMAIN_SET: &str = "bypass_domain_ip";
pub const STATIC_SET: &str = "bypass_static";

pub struct Firewall {
    effector: Arc<dyn Effector>,
    table: String,
}

impl Firewall {
    pub fn new(effector: Arc<dyn Effector>) -> Self {
        Self {
            effector,
            table: TABLE.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Table definition; the leading `table`/`delete table` pair makes
    /// re-creation idempotent within one transaction
    pub fn table_script(&self, lan_interfaces: &[String]) -> String {
        let steer = match lan_interfaces {
            [] => String::new(),
            [one] => format!("        iifname \"{}\" jump select_export\n", one),
            many => format!(
                "        iifname {{ {} }} jump select_export\n",
                many.iter()
                    .map(|i| format!("\"{}\"", i))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        let t = &self.table;

        format!(
            "table ip {t} {{}}\n\
             delete table ip {t}\n\
             table ip {t} {{\n\
             \x20   set {DOMAIN_SET} {{\n\
             \x20       type ipv4_addr;\n\
             \x20   }}\n\
             \x20   set {STATIC_SET} {{\n\
             \x20       type ipv4_addr; flags interval;\n\
             \x20   }}\n\
             \x20   chain prerouting {{\n\
             \x20       type filter hook prerouting priority 0; policy accept;\n\
             {steer}\
             \x20   }}\n\
             \x20   chain select_export {{\n\
             \x20       ip daddr @{STATIC_SET} jump wan\n\
             \x20       ip daddr @{DOMAIN_SET} jump wan\n\
             \x20       jump vpn\n\
             \x20   }}\n\
             \x20   chain vpn {{\n\
             \x20   }}\n\
             \x20   chain wan {{\n\
             \x20   }}\n\
             }}\n"
        )
    }

    /// Create (or re-create) the table with empty chains and sets
    pub async fn install(&self, lan_interfaces: &[String]) -> Result<(), PlatformError> {
        info!(
            "Installing firewall table {} (steering {} interface(s))",
            self.table,
            lan_interfaces.len()
        );
        self.effector
            .run(&SystemCommand::nft_script(self.table_script(lan_interfaces)))
            .await?;
        Ok(())
    }

    pub async fn add_static_bypass(&self, entries: &[String]) -> Result<(), PlatformError> {
        self.set_elements("add", STATIC_SET, entries).await
    }

    pub async fn add_bypass_ips(&self, ips: &[Ipv4Addr]) -> Result<(), PlatformError> {
        let ips: Vec<String> = ips.iter().map(Ipv4Addr::to_string).collect();
        self.set_elements("add", DOMAIN_SET, &ips).await
    }

    pub async fn remove_bypass_ips(&self, ips: &[Ipv4Addr]) -> Result<(), PlatformError> {
        let ips: Vec<String> = ips.iter().map(Ipv4Addr::to_string).collect();
        self.set_elements("delete", DOMAIN_SET, &ips).await
    }

    pub async fn flush_bypass_ips(&self) -> Result<(), PlatformError> {
        self.effector
            .run(&SystemCommand::new(
                "nft",
                ["flush", "set", "ip", self.table.as_str(), DOMAIN_SET],
            ))
            .await?;
        Ok(())
    }

    /// Replace a chain's program with an already rendered script
    pub async fn apply_chain(&self, script: String) -> Result<(), PlatformError> {
        self.effector.run(&SystemCommand::nft_script(script)).await?;
        Ok(())
    }

    pub async fn delete_table(&self) -> Result<(), PlatformError> {
        info!("Deleting firewall table {}", self.table);
        self.effector
            .run(&SystemCommand::new("nft", ["delete", "table", "ip", self.table.as_str()]))
            .await?;
        Ok(())
    }

    async fn set_elements(
        &self,
        verb: &str,
        set: &str,
        elements: &[String],
    ) -> Result<(), PlatformError> {
        if elements.is_empty() {
            return Ok(());
        }
        debug!("nft {} element {} {:?}", verb, set, elements);
        let list = format!("{{ {} }}", elements.join(", "));
        self.effector
            .run(&SystemCommand::new(
                "nft",
                [verb, "element", "ip", self.table.as_str(), set, list.as_str()],
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RecordingEffector;

    fn firewall() -> (Arc<RecordingEffector>, Firewall) {
        let effector = Arc::new(RecordingEffector::new());
        let firewall = Firewall::new(effector.clone());
        (effector, firewall)
    }

    #[test]
    fn test_table_script_layout() {
        let (_, fw) = firewall();
        let script = fw.table_script(&["br-lan".to_string()]);

        assert!(script.starts_with("table ip shieldlink {}\ndelete table ip shieldlink\n"));
        assert!(script.contains("    set bypass_domain_ip {\n        type ipv4_addr;\n    }"));
        assert!(script.contains("type ipv4_addr; flags interval;"));
        assert!(script.contains("        iifname \"br-lan\" jump select_export\n"));
        assert!(script.contains("ip daddr @bypass_static jump wan"));
        assert!(script.contains("ip daddr @bypass_domain_ip jump wan"));
        assert!(script.contains("    chain vpn {\n    }"));
        assert!(script.contains("    chain wan {\n    }"));
    }

    #[test]
    fn test_table_script_multiple_lan() {
        let (_, fw) = firewall();
        let script = fw.table_script(&["lan0".to_string(), "lan1".to_string()]);
        assert!(script.contains("iifname { \"lan0\", \"lan1\" } jump select_export"));

        let script = fw.table_script(&[]);
        assert!(!script.contains("iifname"));
    }

    #[tokio::test]
    async fn test_set_element_commands() {
        let (effector, fw) = firewall();
        fw.add_bypass_ips(&[Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8)])
            .await
            .unwrap();
        fw.remove_bypass_ips(&[Ipv4Addr::new(1, 2, 3, 4)]).await.unwrap();
        fw.add_static_bypass(&["10.0.0.0/8".to_string()]).await.unwrap();
        fw.flush_bypass_ips().await.unwrap();

        assert_eq!(
            effector.rendered(),
            vec![
                "nft add element ip shieldlink bypass_domain_ip { 1.2.3.4, 5.6.7.8 }",
                "nft delete element ip shieldlink bypass_domain_ip { 1.2.3.4 }",
                "nft add element ip shieldlink bypass_static { 10.0.0.0/8 }",
                "nft flush set ip shieldlink bypass_domain_ip",
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_element_list_is_noop() {
        let (effector, fw) = firewall();
        fw.add_bypass_ips(&[]).await.unwrap();
        fw.add_static_bypass(&[]).await.unwrap();
        assert!(effector.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let (effector, fw) = firewall();
        effector.fail_matching("delete table");
        let err = fw.delete_table().await.unwrap_err();
        assert!(err.to_string().contains("nft delete table ip shieldlink"));
    }
}
