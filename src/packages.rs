//! Package assembly and provenance classification.
//!
//! Functions recovered from the line table are grouped by the package
//! component of their symbol names, then every package is assigned to one
//! of five classes. Two classifiers exist: the module-info classifier runs
//! when the binary embeds build info, the path classifier is the fallback
//! and keys off the main package's recorded file path.

use std::collections::HashMap;

use serde::Serialize;

use crate::buildinfo::BuildInfo;
use crate::error::{Error, Result};
use crate::linetable::LineTable;
use crate::stdlib::is_standard_library;

/// Repository hosts whose presence in both name and path marks a vendored
/// package.
const KNOWN_REPOS: [&str; 3] = ["golang.org", "github.com", "gitlab.com"];

/// A function belonging to a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Function {
    /// Base name without package or receiver.
    pub name: String,
    /// Name of the package the function belongs to.
    pub package_name: String,
    /// Entry PC.
    pub offset: u64,
    /// Address of the first instruction past the function.
    pub end: u64,
}

/// A method: a function plus its receiver type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Method {
    /// Receiver rendering from the symbol, e.g. `*Client`.
    pub receiver: String,
    pub function: Function,
}

/// A Go package reconstructed from symbol names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Package {
    /// Name as it appears in symbol strings.
    pub name: String,
    /// Directory recorded for the package's first symbol, or a sentinel
    /// (`<autogenerated>` or empty) kept verbatim.
    pub filepath: String,
    pub functions: Vec<Function>,
    pub methods: Vec<Method>,
}

/// One function or method entry of a source file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Display name; methods are rendered as `<receiver><name>`.
    pub name: String,
    pub start: i32,
    pub end: i32,
}

/// A source file with the functions recovered from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    pub name: String,
    pub entries: Vec<FileEntry>,
}

/// Provenance class of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PackageClass {
    /// Could not be classified.
    Unknown,
    /// Standard library.
    Std,
    /// The main module and its subpackages.
    Main,
    /// Third-party dependency or vendored tree.
    Vendor,
    /// Synthesized by the compiler or linker.
    Generated,
}

/// Classifies a package to its provenance class.
pub trait PackageClassifier: Send + Sync {
    fn classify(&self, pkg: &Package) -> PackageClass;
}

// Slash-path helpers matching the semantics the toolchain uses for the
// paths it records (always forward slashes, `.` for the empty dir).

fn path_clean(p: &str) -> String {
    if p.is_empty() {
        return ".".to_string();
    }
    let trimmed = p.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    trimmed.to_string()
}

fn path_dir(p: &str) -> String {
    match p.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path_clean(&p[..i]),
        None => ".".to_string(),
    }
}

fn path_base(p: &str) -> &str {
    if p.is_empty() {
        return ".";
    }
    let trimmed = p.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

fn is_generated_package(pkg: &Package) -> bool {
    if pkg.filepath == "<autogenerated>" {
        return true;
    }
    if pkg.name.is_empty() && pkg.filepath.is_empty() {
        return true;
    }
    // Assembler stubs linked without a path.
    if pkg.filepath.is_empty() && (pkg.name == "__x86" || pkg.name == "__i686") {
        return true;
    }
    false
}

/// Classifier keyed off the main package's file path; used when the binary
/// carries no module metadata.
pub struct PathPackageClassifier {
    main_filepath: String,
    main_folders: Vec<String>,
}

impl PathPackageClassifier {
    pub fn new(main_filepath: &str) -> PathPackageClassifier {
        PathPackageClassifier {
            main_filepath: main_filepath.to_string(),
            main_folders: vec![path_dir(main_filepath), path_clean(main_filepath)],
        }
    }
}

impl PackageClassifier for PathPackageClassifier {
    fn classify(&self, pkg: &Package) -> PackageClass {
        if pkg.name == "type" || pkg.name.starts_with("type..") {
            return PackageClass::Generated;
        }

        if is_standard_library(&pkg.name) {
            return PackageClass::Std;
        }

        if is_generated_package(pkg) {
            return PackageClass::Generated;
        }

        // Vendored runtime-internal paths such as
        // internal/golang.org/x/net/http2/hpack.
        let tmp = pkg.name.split("/golang.org").next().unwrap_or("");
        if tmp.len() < pkg.name.len() && is_standard_library(tmp) {
            return PackageClass::Std;
        }

        // cgo shims belong to the runtime.
        if pkg.name.starts_with("_cgo_") || pkg.name.starts_with("x_cgo_") {
            return PackageClass::Std;
        }

        // Module cache paths always contain a "@v" version marker.
        if pkg.filepath.contains("@v") {
            return PackageClass::Vendor;
        }

        let parent_folder = path_dir(&pkg.filepath);

        if pkg.filepath.starts_with(&format!("{}/vendor/", self.main_filepath))
            || pkg
                .filepath
                .starts_with(&format!("{}/vendor/", path_dir(&self.main_filepath)))
            || pkg.filepath.starts_with(&format!(
                "{}/vendor/",
                path_dir(&path_dir(&self.main_filepath))
            ))
        {
            return PackageClass::Vendor;
        }

        for folder in &self.main_folders {
            if &parent_folder == folder {
                return PackageClass::Main;
            }
        }

        if pkg.name.starts_with("vendor/") {
            return PackageClass::Vendor;
        }

        for url in KNOWN_REPOS {
            if pkg.name.starts_with(url) && pkg.filepath.contains(url) {
                return PackageClass::Vendor;
            }
        }

        // Same folder name as the main package but outside a vendor tree.
        if !pkg.filepath.contains("vendor/")
            && path_base(&path_dir(&pkg.filepath)) == path_base(&self.main_filepath)
        {
            return PackageClass::Main;
        }

        // Entry point stubs carry no package name.
        if pkg.name.is_empty() && path_base(&pkg.filepath) == "runtime" {
            return PackageClass::Std;
        }

        if pkg.filepath.starts_with(&self.main_filepath) {
            return PackageClass::Main;
        }

        if !pkg.name.is_empty()
            && !pkg.name.contains('/')
            && self.main_filepath.contains(&pkg.name)
        {
            return PackageClass::Main;
        }

        // Binaries built from a file list have no real main path; anything
        // still unclassified is assumed to be part of main.
        if self.main_filepath == "command-line-arguments" {
            return PackageClass::Main;
        }

        PackageClass::Unknown
    }
}

/// Classifier driven by the embedded module graph.
pub struct ModPackageClassifier {
    info: BuildInfo,
}

impl ModPackageClassifier {
    pub fn new(info: BuildInfo) -> ModPackageClassifier {
        ModPackageClassifier { info }
    }
}

impl PackageClassifier for ModPackageClassifier {
    fn classify(&self, pkg: &Package) -> PackageClass {
        if is_standard_library(&pkg.name) {
            return PackageClass::Std;
        }

        if pkg.name == "main" {
            return PackageClass::Main;
        }

        if !self.info.path.is_empty()
            && (pkg.filepath.starts_with(&self.info.path) || pkg.name.starts_with(&self.info.path))
        {
            return PackageClass::Main;
        }

        if let Some(main) = &self.info.main {
            if !main.path.is_empty()
                && (pkg.filepath.starts_with(&main.path) || pkg.name.starts_with(&main.path))
            {
                return PackageClass::Main;
            }
        }

        for dep in &self.info.deps {
            if pkg.filepath.starts_with(&dep.path) || pkg.name.starts_with(&dep.path) {
                // Dependencies at "(devel)" are replaced local modules and
                // belong to the project.
                if dep.version == "(devel)" {
                    return PackageClass::Main;
                }
                return PackageClass::Vendor;
            }
        }

        if is_generated_package(pkg) {
            return PackageClass::Generated;
        }

        if pkg.name.starts_with("_cgo_") || pkg.name.starts_with("x_cgo_") {
            return PackageClass::Std;
        }

        // Anything left is an indirect dependency.
        PackageClass::Vendor
    }
}

/// Packages grouped by class, in the order they were first seen in the
/// line table.
#[derive(Debug, Default)]
pub(crate) struct PackageSet {
    pub std: Vec<Package>,
    pub main: Vec<Package>,
    pub vendor: Vec<Package>,
    pub generated: Vec<Package>,
    pub unknown: Vec<Package>,
}

/// Walks every function in the line table, assembles packages, and runs the
/// appropriate classifier.
pub(crate) fn enumerate_packages(
    tab: &LineTable,
    build_info: Option<&BuildInfo>,
) -> Result<PackageSet> {
    let mut packages: Vec<Package> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for f in tab.funcs() {
        let pkg_name = f.package_name();
        let idx = match index.get(&pkg_name) {
            Some(&i) => i,
            None => {
                // The file path is fixed by the first symbol seen for the
                // package; sentinels are kept verbatim.
                let filepath = match tab.pc_to_file(f.entry).unwrap_or_default() {
                    fp if fp == "<autogenerated>" || fp.is_empty() => fp,
                    fp => path_dir(&fp),
                };
                packages.push(Package {
                    name: pkg_name.clone(),
                    filepath,
                    functions: Vec::new(),
                    methods: Vec::new(),
                });
                index.insert(pkg_name.clone(), packages.len() - 1);
                packages.len() - 1
            }
        };

        let function = Function {
            name: f.base_name(),
            package_name: pkg_name,
            offset: f.entry,
            end: f.end,
        };
        let receiver = f.receiver();
        if receiver.is_empty() {
            packages[idx].functions.push(function);
        } else {
            packages[idx].methods.push(Method { receiver, function });
        }
    }

    let classifier: Box<dyn PackageClassifier> = match build_info {
        Some(bi) if bi.main.is_some() || !bi.path.is_empty() => {
            Box::new(ModPackageClassifier::new(bi.clone()))
        }
        _ => {
            let main = packages
                .iter()
                .find(|p| p.name == "main")
                .ok_or(Error::NoMainPackage)?;
            Box::new(PathPackageClassifier::new(&main.filepath))
        }
    };

    let mut set = PackageSet::default();
    for pkg in packages {
        match classifier.classify(&pkg) {
            PackageClass::Std => set.std.push(pkg),
            PackageClass::Main => set.main.push(pkg),
            PackageClass::Vendor => set.vendor.push(pkg),
            PackageClass::Generated => set.generated.push(pkg),
            PackageClass::Unknown => set.unknown.push(pkg),
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildinfo::Module;

    fn pkg(name: &str, filepath: &str) -> Package {
        Package {
            name: name.to_string(),
            filepath: filepath.to_string(),
            functions: Vec::new(),
            methods: Vec::new(),
        }
    }

    #[test]
    fn path_helpers_match_slash_semantics() {
        assert_eq!(path_dir("/home/u/proj/cmd"), "/home/u/proj");
        assert_eq!(path_dir("cmd"), ".");
        assert_eq!(path_dir("/cmd"), "/");
        assert_eq!(path_base("/home/u/proj/cmd"), "cmd");
        assert_eq!(path_base(""), ".");
        assert_eq!(path_clean(""), ".");
        assert_eq!(path_clean("/a/b/"), "/a/b");
    }

    #[test]
    fn path_classifier_basics() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");

        assert_eq!(
            c.classify(&pkg("main", "/home/u/proj/cmd")),
            PackageClass::Main
        );
        assert_eq!(
            c.classify(&pkg("fmt", "/usr/local/go/src/fmt")),
            PackageClass::Std
        );
        assert_eq!(
            c.classify(&pkg(
                "github.com/x/y",
                "/root/go/pkg/mod/github.com/x/y@v1.2.3"
            )),
            PackageClass::Vendor
        );
        assert_eq!(
            c.classify(&pkg("", "")),
            PackageClass::Generated
        );
    }

    #[test]
    fn path_classifier_type_packages_are_generated() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(c.classify(&pkg("type", "")), PackageClass::Generated);
        assert_eq!(c.classify(&pkg("type..eq", "")), PackageClass::Generated);
    }

    #[test]
    fn path_classifier_autogenerated_sentinel() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(
            c.classify(&pkg("proj", "<autogenerated>")),
            PackageClass::Generated
        );
    }

    #[test]
    fn path_classifier_vendored_golang_org_under_stdlib() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(
            c.classify(&pkg(
                "internal/golang.org/x/net/http2/hpack",
                "/usr/local/go/src/internal/golang.org/x/net/http2/hpack"
            )),
            PackageClass::Std
        );
    }

    #[test]
    fn path_classifier_cgo_is_std() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(c.classify(&pkg("_cgo_gotypes", "/tmp/x")), PackageClass::Std);
        assert_eq!(c.classify(&pkg("x_cgo_init", "/tmp/x")), PackageClass::Std);
    }

    #[test]
    fn path_classifier_vendor_tree() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(
            c.classify(&pkg(
                "github.com/pkg/errors",
                "/home/u/proj/cmd/vendor/github.com/pkg/errors"
            )),
            PackageClass::Vendor
        );
        assert_eq!(
            c.classify(&pkg(
                "github.com/pkg/errors",
                "/home/u/vendor/github.com/pkg/errors"
            )),
            PackageClass::Vendor
        );
    }

    #[test]
    fn path_classifier_vendor_name_prefix() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(
            c.classify(&pkg("vendor/golang.org/x/net/idna", "/somewhere/else")),
            PackageClass::Vendor
        );
    }

    #[test]
    fn path_classifier_known_repo() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(
            c.classify(&pkg(
                "gitlab.com/corp/lib",
                "/go/src/gitlab.com/corp/lib"
            )),
            PackageClass::Vendor
        );
    }

    #[test]
    fn path_classifier_subpackage_of_main() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(
            c.classify(&pkg("cmd/internal", "/home/u/proj/cmd/internal")),
            PackageClass::Main
        );
    }

    #[test]
    fn path_classifier_runtime_entry_stub() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(
            c.classify(&pkg("", "/usr/local/go/src/runtime")),
            PackageClass::Std
        );
    }

    #[test]
    fn path_classifier_command_line_arguments() {
        let c = PathPackageClassifier::new("command-line-arguments");
        assert_eq!(
            c.classify(&pkg("whatever", "/odd/path/elsewhere")),
            PackageClass::Main
        );
    }

    #[test]
    fn path_classifier_unknown_fallthrough() {
        let c = PathPackageClassifier::new("/home/u/proj/cmd");
        assert_eq!(
            c.classify(&pkg("mystery", "/opt/elsewhere/mystery2")),
            PackageClass::Unknown
        );
    }

    fn mod_info() -> BuildInfo {
        BuildInfo {
            compiler: None,
            path: "example.com/cmd/tool".to_string(),
            main: Some(Module {
                path: "example.com/cmd".to_string(),
                version: "(devel)".to_string(),
                sum: String::new(),
                replace: None,
            }),
            deps: vec![
                Module {
                    path: "github.com/spf13/cobra".to_string(),
                    version: "v1.8.0".to_string(),
                    sum: "h1:abc".to_string(),
                    replace: None,
                },
                Module {
                    path: "example.com/lib".to_string(),
                    version: "(devel)".to_string(),
                    sum: String::new(),
                    replace: None,
                },
            ],
            settings: Vec::new(),
        }
    }

    #[test]
    fn mod_classifier_rules() {
        let c = ModPackageClassifier::new(mod_info());

        assert_eq!(c.classify(&pkg("fmt", "")), PackageClass::Std);
        assert_eq!(c.classify(&pkg("main", "/x")), PackageClass::Main);
        assert_eq!(
            c.classify(&pkg("example.com/cmd/tool/sub", "example.com/cmd/tool/sub")),
            PackageClass::Main
        );
        assert_eq!(
            c.classify(&pkg(
                "github.com/spf13/cobra",
                "github.com/spf13/cobra@v1.8.0"
            )),
            PackageClass::Vendor
        );
        // A dependency pinned at (devel) is a replaced local module.
        assert_eq!(
            c.classify(&pkg("example.com/lib/util", "example.com/lib/util")),
            PackageClass::Main
        );
        assert_eq!(c.classify(&pkg("", "")), PackageClass::Generated);
        assert_eq!(c.classify(&pkg("_cgo_gotypes", "/x")), PackageClass::Std);
        // Indirect dependency with no dep entry.
        assert_eq!(
            c.classify(&pkg("github.com/other/lib", "github.com/other/lib")),
            PackageClass::Vendor
        );
    }
}
