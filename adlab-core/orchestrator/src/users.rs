//! 实验室用户名单
//!
//! 用固定种子生成确定性的用户列表，供 adconfig 阶段的导入脚本使用。

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{OrchestratorError, Result};

/// 默认用户数
pub const DEFAULT_USER_COUNT: usize = 100;

/// 默认种子
pub const DEFAULT_SEED: u64 = 42;

/// 部门列表
pub const DEPARTMENTS: [&str; 6] = ["HR", "IT", "Legal", "Finance", "Marketing", "Operations"];

const MANAGERS_PER_DEPARTMENT: usize = 2;
const CONTRACTORS_PER_DEPARTMENT: usize = 4;
const SAM_MAX_LEN: usize = 20;
const PASSWORD_LEN: usize = 16;
const PASSWORD_SYMBOLS: &[u8] = b"!@#$%";

const FIRST_NAMES: &[&str] = &[
    "James", "Mary", "Robert", "Patricia", "John", "Jennifer", "Michael", "Linda", "David",
    "Elizabeth", "William", "Barbara", "Richard", "Susan", "Joseph", "Jessica", "Thomas", "Sarah",
    "Charles", "Karen", "Daniel", "Nancy", "Matthew", "Lisa", "Anthony", "Betty", "Mark",
    "Margaret", "Steven", "Sandra", "Andrew", "Ashley", "Joshua", "Emily", "Kevin", "Donna",
    "Brian", "Michelle", "George", "Carol",
];

const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez",
    "Martinez", "Hernandez", "Lopez", "Gonzalez", "Wilson", "Anderson", "Thomas", "Taylor",
    "Moore", "Jackson", "Martin", "Lee", "Perez", "Thompson", "White", "Harris", "Sanchez",
    "Clark", "Ramirez", "Lewis", "Robinson", "Walker", "Young", "Allen", "King", "Wright",
    "Scott", "Torres", "Nguyen", "Hill", "Flores", "Vanderhoffington-Blackwood",
];

/// 用户角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UserRole {
    Manager,
    Employee,
    Contractor,
}

impl UserRole {
    /// 对应的 OU 名称
    pub fn ou_name(&self) -> &'static str {
        match self {
            UserRole::Manager => "Managers",
            UserRole::Employee => "Employees",
            UserRole::Contractor => "Contractors",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            UserRole::Manager => "Manager",
            UserRole::Employee => "Employee",
            UserRole::Contractor => "Contractor",
        }
    }
}

/// 一条用户记录，字段名与导入脚本的 CSV 表头一致
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LabUser {
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
    pub sam_account_name: String,
    #[serde(rename = "UPN")]
    pub upn: String,
    pub department: String,
    pub role: UserRole,
    #[serde(rename = "OUPath")]
    pub ou_path: String,
    pub password: String,
    pub enabled: bool,
}

const CSV_HEADER: [&str; 10] = [
    "FirstName",
    "LastName",
    "DisplayName",
    "SamAccountName",
    "UPN",
    "Department",
    "Role",
    "OUPath",
    "Password",
    "Enabled",
];

impl LabUser {
    fn csv_fields(&self) -> [String; 10] {
        [
            self.first_name.clone(),
            self.last_name.clone(),
            self.display_name.clone(),
            self.sam_account_name.clone(),
            self.upn.clone(),
            self.department.clone(),
            self.role.title().to_string(),
            self.ou_path.clone(),
            self.password.clone(),
            if self.enabled { "True" } else { "False" }.to_string(),
        ]
    }
}

/// 名单生成器
#[derive(Debug, Clone)]
pub struct RosterGenerator {
    domain: String,
    count: usize,
    seed: u64,
}

impl RosterGenerator {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            count: DEFAULT_USER_COUNT,
            seed: DEFAULT_SEED,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn domain_dn(&self) -> String {
        self.domain
            .split('.')
            .filter(|part| !part.is_empty())
            .map(|part| format!("DC={}", part))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// 生成名单
    ///
    /// 用户按部门均分，余数分给靠前的部门；每个部门先分配经理、合同工，剩余为普通员工。
    pub fn generate(&self) -> Roster {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut existing = HashSet::new();
        let mut users = Vec::with_capacity(self.count);
        let users_ou = format!("OU=Users,OU=ADLab,{}", self.domain_dn());

        let base = self.count / DEPARTMENTS.len();
        let remainder = self.count % DEPARTMENTS.len();

        for (i, department) in DEPARTMENTS.iter().enumerate() {
            let size = base + usize::from(i < remainder);
            let managers = size.min(MANAGERS_PER_DEPARTMENT);
            let contractors = (size - managers).min(CONTRACTORS_PER_DEPARTMENT);
            let employees = size - managers - contractors;

            let roles = std::iter::repeat(UserRole::Manager)
                .take(managers)
                .chain(std::iter::repeat(UserRole::Employee).take(employees))
                .chain(std::iter::repeat(UserRole::Contractor).take(contractors));

            for role in roles {
                let first = pick(&mut rng, FIRST_NAMES);
                let last = pick(&mut rng, LAST_NAMES);
                let sam = sam_account_name(first, last, &existing);
                existing.insert(sam.clone());

                users.push(LabUser {
                    first_name: first.to_string(),
                    last_name: last.to_string(),
                    display_name: format!("{} {}", first, last),
                    upn: format!("{}@{}", sam, self.domain),
                    sam_account_name: sam,
                    department: department.to_string(),
                    role,
                    ou_path: format!("OU={},OU={},{}", role.ou_name(), department, users_ou),
                    password: generate_password(&mut rng),
                    enabled: true,
                });
            }
        }

        Roster { users }
    }
}

fn pick<'a>(rng: &mut StdRng, names: &[&'a str]) -> &'a str {
    names.choose(rng).copied().unwrap_or("User")
}

/// 首字母加姓氏，小写、仅保留字母数字，最长 20 字符；冲突时追加数字后缀
pub fn sam_account_name(first: &str, last: &str, existing: &HashSet<String>) -> String {
    let base: String = first
        .chars()
        .take(1)
        .chain(last.chars())
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(SAM_MAX_LEN)
        .collect();

    let mut candidate = base.clone();
    let mut counter = 1u32;
    while existing.contains(&candidate) {
        let suffix = counter.to_string();
        let keep = SAM_MAX_LEN.saturating_sub(suffix.len()).min(base.len());
        candidate = format!("{}{}", &base[..keep], suffix);
        counter += 1;
    }
    candidate
}

/// 16 位复杂密码：至少包含大写、小写、数字、符号各一个
pub fn generate_password(rng: &mut impl Rng) -> String {
    const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    const DIGITS: &[u8] = b"0123456789";

    let all: Vec<u8> = [UPPER, LOWER, DIGITS, PASSWORD_SYMBOLS].concat();
    let mut chars: Vec<u8> = [UPPER, LOWER, DIGITS, PASSWORD_SYMBOLS]
        .iter()
        .map(|set| set[rng.gen_range(0..set.len())])
        .collect();
    while chars.len() < PASSWORD_LEN {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(rng);
    chars.into_iter().map(char::from).collect()
}

/// 生成的名单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roster {
    pub users: Vec<LabUser>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// 按 "部门/角色" 统计
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut summary = BTreeMap::new();
        for user in &self.users {
            *summary
                .entry(format!("{}/{}", user.department, user.role.title()))
                .or_insert(0) += 1;
        }
        summary
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.users)
            .map_err(|e| OrchestratorError::SerdeError(e.to_string()))
    }

    pub fn to_csv(&self) -> String {
        let mut out = CSV_HEADER.join(",");
        out.push_str("\r\n");
        for user in &self.users {
            let row: Vec<String> = user.csv_fields().iter().map(|f| csv_escape(f)).collect();
            out.push_str(&row.join(","));
            out.push_str("\r\n");
        }
        out
    }

    /// 写出 `users.csv` 与 `users.json`
    pub async fn write_to(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        tokio::fs::create_dir_all(dir).await?;
        let csv_path = dir.join("users.csv");
        let json_path = dir.join("users.json");
        tokio::fs::write(&csv_path, self.to_csv()).await?;
        tokio::fs::write(&json_path, self.to_json()?).await?;
        info!(
            "已写出 {} 个用户: {}, {}",
            self.len(),
            csv_path.display(),
            json_path.display()
        );
        Ok((csv_path, json_path))
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(&[',', '"', '\r', '\n'][..]) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
