use std::fs;
use std::io::stdout;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context as AnyhowContext};
use clap::{self, Args, Subcommand};
use itertools::Itertools;

use harrier::config::HarnessConfig;
use harrier::testapp::{Policy, TestAppCatalogEntry, TestAppIndex, TestAppProvider, TestAppQuery};
use harrier::utils::read_file;
use harrier::Context;

#[derive(Args)]
pub struct Catalog {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show every app in the catalog
    #[command()]
    List(List),

    /// Show the apps a query matches, first match first
    #[command()]
    Query(Query),

    /// Encode a JSON description of test apps into a binary index
    #[command()]
    Pack(Pack),
}

#[derive(Args)]
struct List {
    /// Output JSON instead of text
    #[arg(short, long)]
    json: bool,
}

#[derive(Args)]
struct Query {
    /// Query in plan file syntax, e.g. 'package-name = { starts-with = "com.example" }'
    #[arg(short, long)]
    query: Option<String>,

    /// Exact package name
    #[arg(short, long)]
    package: Option<String>,

    /// Exact label
    #[arg(long)]
    label: Option<String>,

    /// Permission the app must request, may be repeated
    #[arg(long = "permission")]
    permissions: Vec<String>,

    /// Permission the app must not request, may be repeated
    #[arg(long = "without-permission")]
    without_permissions: Vec<String>,

    /// Device admin policy the app must use, may be repeated
    #[arg(long = "policy")]
    policies: Vec<String>,

    /// Only apps with a device admin receiver
    #[arg(short = 'A', long)]
    device_admin: bool,

    /// Only apps that are cross profile
    #[arg(short = 'X', long)]
    cross_profile: bool,

    /// Only show the app a precondition would get
    #[arg(short = '1', long)]
    first: bool,

    /// Output JSON instead of text
    #[arg(short, long)]
    json: bool,
}

#[derive(Args)]
struct Pack {
    /// The JSON description
    #[arg(short, long)]
    input: PathBuf,

    /// Where to write the binary index
    #[arg(short, long)]
    output: PathBuf,
}

impl Catalog {
    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        match &self.command {
            Command::List(c) => c.run(&provider(ctx)?),
            Command::Query(c) => c.run(&provider(ctx)?),
            Command::Pack(c) => c.run(),
        }
    }
}

fn provider(ctx: &dyn Context) -> anyhow::Result<TestAppProvider> {
    let cfg = HarnessConfig::load(ctx)?;
    Ok(TestAppProvider::from_config(
        &cfg.catalog,
        &ctx.get_project_dir()?,
    ))
}

fn print_entries(entries: &[Arc<TestAppCatalogEntry>], json: bool) -> anyhow::Result<()> {
    if json {
        let refs: Vec<&TestAppCatalogEntry> = entries.iter().map(|e| e.as_ref()).collect();
        serde_json::to_writer(stdout(), &refs)?;
        return Ok(());
    }
    for e in entries {
        println!("{}", describe(e));
    }
    Ok(())
}

fn describe(e: &TestAppCatalogEntry) -> String {
    let mut flags = Vec::new();
    if e.is_device_admin() {
        flags.push("admin");
    }
    if e.cross_profile {
        flags.push("cross-profile");
    }
    if e.test_only {
        flags.push("test-only");
    }
    let mut s = e.package_name.clone();
    if !e.label.is_empty() {
        s.push_str(&format!(" \"{}\"", e.label));
    }
    s.push_str(&format!(" sdk {}..{}", e.min_sdk_version, e.target_sdk_version));
    if !flags.is_empty() {
        s.push_str(&format!(" [{}]", flags.join(", ")));
    }
    if !e.policies.is_empty() {
        s.push_str(&format!(" policies: {}", e.policies.iter().join(", ")));
    }
    s
}

impl List {
    fn run(&self, provider: &TestAppProvider) -> anyhow::Result<()> {
        print_entries(&provider.entries()?, self.json)
    }
}

impl Query {
    fn build_query(&self) -> anyhow::Result<TestAppQuery> {
        let base = match &self.query {
            Some(q) => toml::from_str::<TestAppQuery>(q).with_context(|| format!("parsing query {}", q))?,
            None => TestAppQuery::default(),
        };
        let mut builder = TestAppQuery::builder().from_query(base);

        if let Some(p) = &self.package {
            builder = builder.where_package_name().is_equal_to(p);
        }
        if let Some(l) = &self.label {
            builder = builder.where_label().is_equal_to(l);
        }
        for p in &self.permissions {
            builder = builder.where_permissions().contains(p);
        }
        for p in &self.without_permissions {
            builder = builder.where_permissions().does_not_contain(p);
        }
        for p in &self.policies {
            let policy = Policy::from_str(p).map_err(|e| anyhow::anyhow!("{}", e))?;
            builder = builder.where_policies().contains(policy);
        }
        if self.device_admin {
            builder = builder.where_is_device_admin().is_true();
        }
        if self.cross_profile {
            builder = builder.where_cross_profile().is_true();
        }
        Ok(builder.build())
    }

    fn run(&self, provider: &TestAppProvider) -> anyhow::Result<()> {
        let query = self.build_query()?;
        let mut found = provider.matching(&query)?;
        if found.is_empty() {
            bail!(harrier::Error::NoMatchingTestApp(query.to_string()));
        }
        if self.first {
            found.truncate(1);
        }
        print_entries(&found, self.json)
    }
}

impl Pack {
    fn run(&self) -> anyhow::Result<()> {
        let content = read_file(&self.input)?;
        let index = TestAppIndex::from_json(&content)?;
        let bytes = index.to_bytes()?;
        fs::write(&self.output, &bytes)
            .with_context(|| format!("writing {}", self.output.display()))?;
        println!(
            "packed {} apps into {} ({} bytes)",
            index.apps.len(),
            self.output.display(),
            bytes.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use harrier::testapp::{AndroidApp, Permission};
    use rstest::*;

    fn query_args() -> Query {
        Query {
            query: None,
            package: None,
            label: None,
            permissions: Vec::new(),
            without_permissions: Vec::new(),
            policies: Vec::new(),
            device_admin: false,
            cross_profile: false,
            first: false,
            json: false,
        }
    }

    #[fixture]
    fn catalog() -> TestAppProvider {
        let app = |pkg: &str, perms: &[&str], cross_profile: bool| {
            let proto = AndroidApp {
                package_name: pkg.into(),
                permissions: perms.iter().map(|p| Permission::from(*p)).collect(),
                cross_profile,
                ..Default::default()
            };
            TestAppCatalogEntry::from_proto(proto, None).unwrap()
        };
        TestAppProvider::from_entries(
            vec![
                app("com.example.b", &["android.permission.INTERNET"], true),
                app("com.example.a", &["android.permission.INTERNET"], false),
                app("org.other", &[], true),
            ],
            PathBuf::from("/apks"),
        )
    }

    #[rstest]
    fn test_flags_and_toml_combine(catalog: TestAppProvider) {
        let mut args = query_args();
        args.query = Some("package-name = { starts-with = \"com.example\" }".into());
        args.permissions.push("android.permission.INTERNET".into());
        args.cross_profile = true;

        let query = args.build_query().unwrap();
        let found = catalog.matching(&query).unwrap();
        let packages: Vec<&str> = found.iter().map(|e| e.package_name.as_str()).collect();
        assert_eq!(packages, vec!["com.example.b"]);
    }

    #[rstest]
    fn test_matches_in_package_order(catalog: TestAppProvider) {
        let mut args = query_args();
        args.permissions.push("android.permission.INTERNET".into());
        let found = catalog.matching(&args.build_query().unwrap()).unwrap();
        assert_eq!(found[0].package_name, "com.example.a");
        // Listing doesn't use anything up
        assert_eq!(catalog.available_count().unwrap(), 3);
    }

    #[test]
    fn test_bad_query_rejected() {
        let mut args = query_args();
        args.query = Some("package = \"x\"".into());
        assert!(args.build_query().is_err());

        let mut args = query_args();
        args.policies.push("not-a-policy".into());
        assert!(args.build_query().is_err());
    }

    #[test]
    fn test_pack_json_description() {
        let dir = std::env::temp_dir().join(format!("harrier-pack-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let input = dir.join("index.json");
        fs::write(
            &input,
            r#"{"apps": [
                {"packageName": "com.example.a", "permissions": [{"name": "android.permission.INTERNET"}]},
                {"package_name": "com.example.b", "cross_profile": true}
            ]}"#,
        )
        .unwrap();
        let pack = Pack {
            input,
            output: dir.join("index.pb"),
        };
        pack.run().unwrap();

        let bytes = fs::read(&pack.output).unwrap();
        let index = TestAppIndex::parse(&bytes).unwrap();
        fs::remove_dir_all(&dir).unwrap();
        assert_eq!(index.apps.len(), 2);
        assert_eq!(index.apps[0].permissions[0].name, "android.permission.INTERNET");
        assert!(index.apps[1].cross_profile);
    }

    #[rstest]
    fn test_describe(catalog: TestAppProvider) {
        let entries = catalog.entries().unwrap();
        assert_eq!(describe(&entries[2]), "org.other sdk 0..0 [cross-profile]");
    }
}
