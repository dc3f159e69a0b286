//! 标准部署计划
//!
//! 十个阶段，模板来自 `azure.template_dir`，较长的远程脚本来自 `azure.script_dir`，
//! 验证脚本内联在计划中。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use adlab_remote_executor::Target;

use crate::config::{LabConfig, NodeRole};
use crate::health::ExpectedPattern;
use crate::phase::{ArtifactKind, ParamValue, Phase, PhaseId, ScriptSource, Step, StepPolicy};
use crate::poller::ReadyCondition;
use crate::roles::RoleScripts;
use crate::users::DEFAULT_USER_COUNT;
use crate::{OrchestratorError, Result};

const CONNECTIVITY_CHECK: &str = r#"Write-Output "Hostname: $env:COMPUTERNAME"
Get-NetIPAddress -AddressFamily IPv4 | Where-Object { $_.PrefixOrigin -ne 'WellKnown' } | ForEach-Object { Write-Output "IPv4: $($_.IPAddress)" }
"#;

const AD_DS_CHECK: &str = r#"$domain = Get-ADDomain
Write-Output "DomainDNSRoot: $($domain.DNSRoot)"
Write-Output "ADWS: $((Get-Service ADWS).Status)"
"#;

const DOMAIN_MEMBER_CHECK: &str = r#"$cs = Get-CimInstance Win32_ComputerSystem
Write-Output "PartOfDomain: $($cs.PartOfDomain)"
Write-Output "Domain: $($cs.Domain)"
"#;

const USER_COUNT_CHECK: &str = r#"param([string]$SearchBase)
Write-Output "UserCount: $(@(Get-ADUser -Filter * -SearchBase $SearchBase).Count)"
"#;

const GROUP_COUNT_CHECK: &str = r#"param([string]$SearchBase)
Write-Output "GroupCount: $(@(Get-ADGroup -Filter * -SearchBase $SearchBase).Count)"
"#;

fn template(config: &LabConfig, name: &str) -> PathBuf {
    config.azure.template_dir.join(name)
}

fn script(dir: &Path, name: &str) -> ScriptSource {
    ScriptSource::File(dir.join(name))
}

fn params<const N: usize>(entries: [(&str, ParamValue); N]) -> BTreeMap<String, ParamValue> {
    entries
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// 构建标准十阶段计划
pub fn standard_plan(config: &LabConfig) -> Result<Vec<Phase>> {
    let scripts = config.azure.script_dir.as_path();
    let primary_dc = config.primary_dc()?;
    let secondary_dc = config.secondary_dc()?;
    let all = config.all_targets();
    let members = config.member_targets();
    let app_servers = config.targets_with_role(NodeRole::AppServer);
    // 灾备域控提升与成员入域都以主域控地址作为 DNS，缺失时不能生成计划
    let primary_ip = config
        .private_ip(&primary_dc)
        .map(str::to_string)
        .ok_or_else(|| {
            OrchestratorError::ConfigError(format!("主域控 {} 未配置 private_ip", primary_dc))
        })?;
    let storage_account = config
        .azure
        .storage_account
        .clone()
        .ok_or_else(|| OrchestratorError::ConfigError("未配置 azure.storage_account".to_string()))?;
    let domain = config.lab.domain.clone();
    let domain_pattern = regex::escape(&domain);
    let admin_password = ParamValue::Secret(config.lab.admin_password_secret.clone());
    let dsrm_password = ParamValue::Secret(config.lab.dsrm_password_secret.clone());
    let users_base = format!("OU=Users,OU=ADLab,{}", config.domain_dn());
    let groups_base = format!("OU=Groups,OU=ADLab,{}", config.domain_dn());
    let ready_timeout = config.polling.ready_timeout;
    let settle = config.polling.reboot_settle;

    // 1. 网络、存储
    let mut infra = Phase::new(PhaseId::Infra).produces(ArtifactKind::ScriptAccessToken);
    for (name, region) in &config.regions {
        infra = infra.step(Step::ResourceDeploy {
            template: template(config, "network.bicep"),
            region: name.clone(),
            parameters: params([
                ("regionName", ParamValue::literal(name.as_str())),
                ("resourceGroupName", ParamValue::literal(region.resource_group.as_str())),
            ]),
        });
    }
    infra = infra.step(Step::ResourceDeploy {
        template: template(config, "storage.bicep"),
        region: config.lab.primary_region.clone(),
        parameters: params([
            (
                "storageAccountName",
                ParamValue::literal(storage_account.as_str()),
            ),
            ("containerName", ParamValue::literal(config.azure.script_container.as_str())),
        ]),
    });

    // 2. 虚拟机
    let mut vms = Phase::new(PhaseId::Vms);
    for region in config.regions.keys() {
        let nodes: Vec<serde_json::Value> = config
            .nodes
            .iter()
            .filter(|n| &n.region == region)
            .map(|n| {
                serde_json::json!({
                    "name": n.name,
                    "role": n.role,
                    "privateIp": n.private_ip,
                })
            })
            .collect();
        if nodes.is_empty() {
            continue;
        }
        vms = vms.step(Step::ResourceDeploy {
            template: template(config, "vms.bicep"),
            region: region.clone(),
            parameters: params([("nodes", ParamValue::Json(serde_json::Value::Array(nodes)))]),
        });
    }
    vms = vms.step(Step::Wait {
        targets: all.clone(),
        condition: ReadyCondition::AgentReady,
        timeout: ready_timeout,
    });

    // 3. 连通性验证
    let validate = Phase::new(PhaseId::Validate).step(Step::Validate {
        targets: all.clone(),
        description: "节点连通性".to_string(),
        script: ScriptSource::Inline(CONNECTIVITY_CHECK.to_string()),
        parameters: BTreeMap::new(),
        expect: vec![
            ExpectedPattern::presence("hostname", r"Hostname:\s*\S+"),
            ExpectedPattern::presence("ipv4", r"IPv4:\s*\d+\.\d+\.\d+\.\d+"),
        ],
    });

    // 4. 主域控
    let primarydc = Phase::new(PhaseId::PrimaryDc)
        .step(Step::RemoteCommand {
            target: primary_dc.clone(),
            description: "提升主域控 (新林)".to_string(),
            script: script(scripts, "Promote-PrimaryDC.ps1"),
            parameters: params([
                ("DomainName", ParamValue::literal(domain.as_str())),
                ("SafeModePassword", dsrm_password.clone()),
            ]),
            expect_reboot: true,
            on_failure: StepPolicy::Halt,
        })
        .step(Step::Pause {
            duration: settle,
            reason: "等待域控重启".to_string(),
        })
        .step(Step::Wait {
            targets: vec![primary_dc.clone()],
            condition: ReadyCondition::AgentReady,
            timeout: ready_timeout,
        })
        .step(ad_ds_check(&primary_dc, &domain_pattern));

    // 5. DNS 与对等
    let dns_peering = Phase::new(PhaseId::DnsPeering)
        .step(Step::ResourceDeploy {
            template: template(config, "dns-peering.bicep"),
            region: config.lab.primary_region.clone(),
            parameters: params([
                ("dnsServers", ParamValue::Json(serde_json::json!([primary_ip]))),
                ("peerRegion", ParamValue::literal(config.lab.secondary_region.as_str())),
            ]),
        })
        .step(Step::RemoteCommand {
            target: primary_dc.clone(),
            description: "配置 DNS 转发器".to_string(),
            script: script(scripts, "Configure-DnsForwarders.ps1"),
            parameters: params([("DomainName", ParamValue::literal(domain.as_str()))]),
            expect_reboot: false,
            on_failure: StepPolicy::Continue,
        });

    // 6. 灾备域控
    let secondarydc = Phase::new(PhaseId::SecondaryDc)
        .step(Step::RemoteCommand {
            target: secondary_dc.clone(),
            description: "提升灾备域控 (加入现有域)".to_string(),
            script: script(scripts, "Promote-SecondaryDC.ps1"),
            parameters: params([
                ("DomainName", ParamValue::literal(domain.as_str())),
                ("PrimaryDcIp", ParamValue::literal(primary_ip.as_str())),
                ("AdminUsername", ParamValue::literal(config.lab.admin_username.as_str())),
                ("AdminPassword", admin_password.clone()),
                ("SafeModePassword", dsrm_password),
            ]),
            expect_reboot: true,
            on_failure: StepPolicy::Halt,
        })
        .step(Step::Pause {
            duration: settle,
            reason: "等待域控重启".to_string(),
        })
        .step(Step::Wait {
            targets: vec![secondary_dc.clone()],
            condition: ReadyCondition::AgentReady,
            timeout: ready_timeout,
        })
        .step(ad_ds_check(&secondary_dc, &domain_pattern))
        .step(Step::Validate {
            targets: vec![secondary_dc.clone()],
            description: "跨区域复制".to_string(),
            script: ScriptSource::Inline(RoleScripts::default().replication_check),
            parameters: BTreeMap::new(),
            expect: vec![ExpectedPattern::failure_count(
                "replication",
                r"(?i)ReplicationFailures:\s*(\d+)",
            )],
        });

    // 7. 应用服务器
    let mut appservers = Phase::new(PhaseId::AppServers);
    for target in &app_servers {
        appservers = appservers.step(Step::RemoteCommand {
            target: target.clone(),
            description: "配置应用服务器角色".to_string(),
            script: script(scripts, "Configure-AppServer.ps1"),
            parameters: BTreeMap::new(),
            expect_reboot: false,
            on_failure: StepPolicy::Continue,
        });
    }

    // 8. OU 与用户
    let adconfig = Phase::new(PhaseId::AdConfig)
        .consumes(ArtifactKind::ScriptAccessToken)
        .step(Step::RemoteCommand {
            target: primary_dc.clone(),
            description: "创建 OU 并导入用户".to_string(),
            script: script(scripts, "Import-Users.ps1"),
            parameters: params([
                ("DomainDn", ParamValue::literal(config.domain_dn())),
                (
                    "StorageAccount",
                    ParamValue::literal(storage_account.as_str()),
                ),
                ("Container", ParamValue::literal(config.azure.script_container.as_str())),
                ("SasToken", ParamValue::Artifact(ArtifactKind::ScriptAccessToken)),
            ]),
            expect_reboot: false,
            on_failure: StepPolicy::Continue,
        })
        .step(Step::Validate {
            targets: vec![primary_dc.clone()],
            description: "用户数量".to_string(),
            script: ScriptSource::Inline(USER_COUNT_CHECK.to_string()),
            parameters: params([("SearchBase", ParamValue::literal(users_base))]),
            expect: vec![ExpectedPattern::minimum_count(
                "users",
                r"UserCount:\s*(\d+)",
                DEFAULT_USER_COUNT as u64,
            )],
        });

    // 9. 加入域
    let mut domainjoin = Phase::new(PhaseId::DomainJoin).consumes(ArtifactKind::ScriptAccessToken);
    for target in &members {
        domainjoin = domainjoin.step(Step::RemoteCommand {
            target: target.clone(),
            description: "加入域".to_string(),
            script: script(scripts, "Join-Domain.ps1"),
            parameters: params([
                ("DomainName", ParamValue::literal(domain.as_str())),
                ("DnsServer", ParamValue::literal(primary_ip.as_str())),
                ("AdminUsername", ParamValue::literal(config.lab.admin_username.as_str())),
                ("AdminPassword", admin_password.clone()),
                ("SasToken", ParamValue::Artifact(ArtifactKind::ScriptAccessToken)),
            ]),
            expect_reboot: true,
            on_failure: StepPolicy::Continue,
        });
    }
    domainjoin = domainjoin
        .step(Step::Pause {
            duration: settle,
            reason: "等待成员节点重启".to_string(),
        })
        .step(Step::Wait {
            targets: members.clone(),
            condition: ReadyCondition::AgentReady,
            timeout: ready_timeout,
        })
        .step(Step::Validate {
            targets: members.clone(),
            description: "域成员身份".to_string(),
            script: ScriptSource::Inline(DOMAIN_MEMBER_CHECK.to_string()),
            parameters: BTreeMap::new(),
            expect: vec![
                ExpectedPattern::presence("joined", r"PartOfDomain:\s*True"),
                ExpectedPattern::presence("domain", format!(r"(?i)Domain:\s*{}", domain_pattern)),
            ],
        });

    // 10. 安全组
    let groups = Phase::new(PhaseId::Groups)
        .step(Step::RemoteCommand {
            target: primary_dc.clone(),
            description: "创建安全组与成员关系".to_string(),
            script: script(scripts, "Configure-Groups.ps1"),
            parameters: params([("DomainDn", ParamValue::literal(config.domain_dn()))]),
            expect_reboot: false,
            on_failure: StepPolicy::Continue,
        })
        .step(Step::Validate {
            targets: vec![primary_dc],
            description: "安全组数量".to_string(),
            script: ScriptSource::Inline(GROUP_COUNT_CHECK.to_string()),
            parameters: params([("SearchBase", ParamValue::literal(groups_base))]),
            expect: vec![ExpectedPattern::minimum_count(
                "groups",
                r"GroupCount:\s*(\d+)",
                crate::users::DEPARTMENTS.len() as u64,
            )],
        });

    Ok(vec![
        infra,
        vms,
        validate,
        primarydc,
        dns_peering,
        secondarydc,
        appservers,
        adconfig,
        domainjoin,
        groups,
    ])
}

fn ad_ds_check(target: &Target, domain_pattern: &str) -> Step {
    Step::Validate {
        targets: vec![target.clone()],
        description: "AD DS 服务".to_string(),
        script: ScriptSource::Inline(AD_DS_CHECK.to_string()),
        parameters: BTreeMap::new(),
        expect: vec![
            ExpectedPattern::presence("domain", format!(r"(?i)DomainDNSRoot:\s*{}", domain_pattern)),
            ExpectedPattern::presence("adws", r"ADWS:\s*Running"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::phase::plan_to_yaml;

    #[test]
    fn test_standard_plan_order() {
        let plan = standard_plan(&sample()).unwrap();
        let ids: Vec<PhaseId> = plan.iter().map(|p| p.id).collect();
        assert_eq!(ids, PhaseId::ALL.to_vec());
        for phase in &plan {
            phase.validate().unwrap();
            assert!(!phase.steps.is_empty(), "{} 没有步骤", phase.id);
        }
    }

    #[test]
    fn test_token_flow() {
        let plan = standard_plan(&sample()).unwrap();
        let infra = &plan[0];
        assert_eq!(infra.produces, vec![ArtifactKind::ScriptAccessToken]);
        assert!(plan[1].consumes.is_empty());

        let consumers: Vec<PhaseId> = plan
            .iter()
            .filter(|p| p.consumes.contains(&ArtifactKind::ScriptAccessToken))
            .map(|p| p.id)
            .collect();
        assert_eq!(consumers, vec![PhaseId::AdConfig, PhaseId::DomainJoin]);
    }

    #[test]
    fn test_promotion_expects_reboot_and_halts() {
        let plan = standard_plan(&sample()).unwrap();
        let primarydc = plan.iter().find(|p| p.id == PhaseId::PrimaryDc).unwrap();
        match &primarydc.steps[0] {
            Step::RemoteCommand {
                target,
                expect_reboot,
                on_failure,
                parameters,
                ..
            } => {
                assert_eq!(target, &Target::new("primary", "dc01"));
                assert!(*expect_reboot);
                assert_eq!(*on_failure, StepPolicy::Halt);
                assert_eq!(
                    parameters.get("SafeModePassword"),
                    Some(&ParamValue::Secret("dsrmPassword".to_string()))
                );
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_domain_join_covers_members() {
        let plan = standard_plan(&sample()).unwrap();
        let join = plan.iter().find(|p| p.id == PhaseId::DomainJoin).unwrap();
        let joins = join
            .steps
            .iter()
            .filter(|s| matches!(s, Step::RemoteCommand { .. }))
            .count();
        assert_eq!(joins, 5);
    }

    #[test]
    fn test_missing_primary_ip_rejected() {
        let mut config = sample();
        for node in config.nodes.iter_mut().filter(|n| n.name == "dc01") {
            node.private_ip = None;
        }
        assert!(config.validate().is_ok());
        match standard_plan(&config) {
            Err(OrchestratorError::ConfigError(message)) => assert!(message.contains("private_ip")),
            other => panic!("unexpected: {:?}", other.map(|plan| plan.len())),
        }
    }

    #[test]
    fn test_missing_storage_account_rejected() {
        let mut config = sample();
        config.azure.storage_account = None;
        match standard_plan(&config) {
            Err(OrchestratorError::ConfigError(message)) => {
                assert!(message.contains("storage_account"))
            }
            other => panic!("unexpected: {:?}", other.map(|plan| plan.len())),
        }
    }

    #[test]
    fn test_primary_ip_flows_into_dependent_steps() {
        let plan = standard_plan(&sample()).unwrap();
        let secondarydc = plan.iter().find(|p| p.id == PhaseId::SecondaryDc).unwrap();
        match &secondarydc.steps[0] {
            Step::RemoteCommand { parameters, .. } => assert_eq!(
                parameters.get("PrimaryDcIp"),
                Some(&ParamValue::literal("10.10.1.4"))
            ),
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_plan_yaml_has_no_secret_values() {
        let yaml = plan_to_yaml(&standard_plan(&sample()).unwrap()).unwrap();
        assert!(yaml.contains("adminPassword"));
        assert!(yaml.contains("dns-peering"));
    }
}
