//! The restart-tolerant package-construction state machine.
//!
//! One construction walks lookup → descriptor → modules → execution →
//! partial build → boundary check → finalize, suspending whenever a graph
//! dependency is missing. Re-invocation restarts the function from the
//! top, so the two expensive intermediate results — the compiled
//! description file and the executed-but-unfinalized package — are cached
//! in the construction's compute state. The compiled file is discarded as
//! soon as module loading commits, which bounds peak memory to one
//! in-flight descriptor per concurrently loading package.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use loadstone_lua::exec::{ExecHooks, GlobArgs, ModuleChunk, TargetDecl, execute_program};
use tracing::{debug, info};

use crate::compile::{CompiledPkgFile, compile_pkg_file};
use crate::error::{LoadError, LoadErrorKind};
use crate::events::{Event, Postable};
use crate::globber::{self, GlobFailure, GlobOperation, HybridGlobber};
use crate::graph::engine::GraphFns;
use crate::graph::{GraphEnv, GraphKey, GraphValue, ModuleSource, Outcome};
use crate::id::{PackageId, parse_module_ref};
use crate::lookup::{self, PackageLookup, RepoRoot};
use crate::package::PackageBuilder;
use crate::resolve;
use crate::vfs::{FileState, Root, RootedPath};
use crate::workspace;

/// The top-level loader: configuration plus the dispatch table for every
/// node kind this crate computes.
pub struct Loader {
  workspace_root: Root,
  show_progress: bool,
  packages_loaded: AtomicUsize,
  compiles: AtomicUsize,
}

#[derive(Default)]
struct LoaderState {
  /// Survives restarts between compilation and module-loading commit.
  compiled: Option<CompiledPkgFile>,
  /// Survives restarts between execution and finalization.
  loaded: Option<LoadedPackage>,
}

struct LoadedPackage {
  builder: PackageBuilder,
  glob_deps: BTreeSet<GraphKey>,
}

impl Loader {
  pub fn new(workspace_root: Root) -> Self {
    Self {
      workspace_root,
      show_progress: false,
      packages_loaded: AtomicUsize::new(0),
      compiles: AtomicUsize::new(0),
    }
  }

  pub fn with_progress(mut self, show_progress: bool) -> Self {
    self.show_progress = show_progress;
    self
  }

  pub fn workspace_root(&self) -> &Root {
    &self.workspace_root
  }

  /// Packages finalized without errors since this loader was created.
  pub fn packages_loaded(&self) -> usize {
    self.packages_loaded.load(Ordering::Relaxed)
  }

  /// How many description files were actually compiled (a restart that
  /// reuses its cached descriptor does not count).
  pub fn compiles(&self) -> usize {
    self.compiles.load(Ordering::Relaxed)
  }

  fn package_fn(&self, id: &PackageId, env: &mut dyn GraphEnv) -> Result<Outcome<GraphValue>, LoadError> {
    // Main-repository packages are looked up with the virtual fallback
    // enabled; the lookup decides whether this package is real or virtual.
    let lookup_id = id.with_maybe_virtual(id.repo().is_main());
    let lookup_value = match env
      .lookup(&GraphKey::PackageLookup(lookup_id))
      .map_err(|error| error.for_package(id))?
    {
      Outcome::Pending => return Ok(Outcome::Pending),
      Outcome::Ready(value) => value,
    };
    let lookup_value = lookup_value
      .as_package_lookup()
      .cloned()
      .ok_or_else(|| internal("package lookup produced a foreign value"))?;

    let (root, build_file, is_virtual) = match &*lookup_value {
      PackageLookup::Exists {
        root,
        build_file,
        is_virtual,
      } => (root.clone(), build_file.clone(), *is_virtual),
      PackageLookup::NoBuildFile { message } => {
        return Err(LoadError::persistent(LoadErrorKind::NoBuildFile(message.clone())).for_package(id));
      }
      PackageLookup::NoRepository { message } => {
        return Err(LoadError::persistent(LoadErrorKind::RepositoryNotFound(message.clone())).for_package(id));
      }
      PackageLookup::InvalidName { message } => {
        return Err(LoadError::persistent(LoadErrorKind::InvalidPackageName(message.clone())).for_package(id));
      }
    };

    if env.state().get_or_default::<LoaderState>().loaded.is_none() {
      match self.load_package_stage(id, &root, &build_file, is_virtual, env)? {
        Outcome::Pending => return Ok(Outcome::Pending),
        Outcome::Ready(loaded) => {
          env.state().get_or_default::<LoaderState>().loaded = Some(loaded);
        }
      }
    }

    let mut loaded = env
      .state()
      .get_or_default::<LoaderState>()
      .loaded
      .take()
      .ok_or_else(|| internal("loaded package vanished from compute state"))?;

    // A fallback-globbing failure surfaces here, like the original
    // observation point; boundary checking runs only on a clean partial
    // build because it mutates the indexed target set.
    let mut fallback_failure: Option<LoadError> = None;
    match loaded.builder.build_partial() {
      Ok(()) => self.check_boundaries(id, &mut loaded.builder, env)?,
      Err(failure) => {
        fallback_failure = Some(failure.to_load_error().for_package(id));
      }
    }

    self.handle_glob_deps(id, &loaded.glob_deps, loaded.builder.contains_errors(), env)?;

    if let Some(failure) = fallback_failure {
      // Thrown before the missing-values check: this may be the last
      // chance to report it.
      return Err(failure);
    }

    if env.values_missing() {
      env.state().get_or_default::<LoaderState>().loaded = Some(loaded);
      return Ok(Outcome::Pending);
    }

    // Finalize: replay diagnostics exactly once, hand off the immutable
    // package.
    let builder = loaded.builder;
    let contains_errors = builder.contains_errors();
    for event in builder.events() {
      env.reporter().handle(event);
    }
    for postable in builder.posts() {
      env.reporter().post(postable);
    }
    let targets = builder.target_count();
    let package = Arc::new(builder.finish_build());
    env.reporter().post(&Postable::PackageLoaded {
      id: id.clone(),
      targets,
      contains_errors,
    });
    if !contains_errors {
      self.packages_loaded.fetch_add(1, Ordering::Relaxed);
    }
    info!(package = %id, targets, contains_errors, "package loaded");
    Ok(Outcome::Ready(GraphValue::Package(package)))
  }

  fn load_package_stage(
    &self,
    id: &PackageId,
    root: &Root,
    build_file: &RootedPath,
    is_virtual: bool,
    env: &mut dyn GraphEnv,
  ) -> Result<Outcome<LoadedPackage>, LoadError> {
    let config = match workspace::resolved(env)? {
      Outcome::Pending => return Ok(Outcome::Pending),
      Outcome::Ready(config) => config,
    };

    let cached = env.state().get_or_default::<LoaderState>().compiled.take();
    let compiled = match cached {
      Some(compiled) => {
        debug!(package = %id, "reusing compiled description file across restart");
        compiled
      }
      None => match self.compile_stage(id, build_file, is_virtual, config.prelude.as_deref(), env)? {
        Outcome::Pending => return Ok(Outcome::Pending),
        Outcome::Ready(compiled) => compiled,
      },
    };

    let modules = match self.modules_stage(id, &compiled, env)? {
      Outcome::Pending => {
        // Keep the descriptor so the restart skips straight past
        // compilation.
        env.state().get_or_default::<LoaderState>().compiled = Some(compiled);
        return Ok(Outcome::Pending);
      }
      Outcome::Ready(modules) => modules,
    };

    // Module loading succeeded: the construction is committed and will
    // not suspend again. The descriptor dies with this stack frame.
    Ok(Outcome::Ready(self.execute_stage(id, root, build_file, compiled, modules, env)))
  }

  fn compile_stage(
    &self,
    id: &PackageId,
    build_file: &RootedPath,
    is_virtual: bool,
    prelude: Option<&str>,
    env: &mut dyn GraphEnv,
  ) -> Result<Outcome<CompiledPkgFile>, LoadError> {
    let state_key = if is_virtual {
      GraphKey::VirtualFileState(build_file.clone())
    } else {
      GraphKey::FileState(build_file.clone())
    };
    let state = match env.lookup(&state_key).map_err(|error| error.for_package(id))? {
      Outcome::Pending => return Ok(Outcome::Pending),
      Outcome::Ready(value) => value,
    };
    if !state.as_file_state().map(FileState::exists).unwrap_or(false) {
      return Err(
        LoadError::persistent(LoadErrorKind::InconsistentFilesystem(format!(
          "package lookup succeeded but '{}' no longer exists",
          build_file.rel
        )))
        .for_package(id),
      );
    }

    if self.show_progress {
      env.reporter().handle(&Event::progress(format!("Loading package: {}", id)));
    }

    let bytes: Vec<u8> = if is_virtual {
      match env
        .lookup(&GraphKey::VirtualFileContent(build_file.clone()))
        .map_err(|error| error.for_package(id))?
      {
        Outcome::Pending => return Ok(Outcome::Pending),
        Outcome::Ready(value) => value
          .as_file_content()
          .map(|bytes| bytes.as_ref().clone())
          .ok_or_else(|| internal("virtual content produced a foreign value"))?,
      }
    } else {
      std::fs::read(build_file.as_path()).map_err(|err| {
        // The work leading here succeeded, so report the read failure as
        // transient rather than giving up on the package permanently.
        LoadError::transient(LoadErrorKind::BuildFileContainsErrors(format!(
          "error reading '{}': {}",
          build_file.rel, err
        )))
        .for_package(id)
      })?
    };

    let prelude_module = match prelude {
      None => None,
      Some(label) => match self.prelude_stage(id, label, env)? {
        Outcome::Pending => return Ok(Outcome::Pending),
        Outcome::Ready(module) => Some(module),
      },
    };

    self.compiles.fetch_add(1, Ordering::Relaxed);
    compile_pkg_file(&build_file.rel, &bytes, prelude_module.as_deref())
      .map(Outcome::Ready)
      .map_err(|error| error.for_package(id))
  }

  fn prelude_stage(
    &self,
    id: &PackageId,
    label: &str,
    env: &mut dyn GraphEnv,
  ) -> Result<Outcome<Arc<ModuleSource>>, LoadError> {
    let (repo, rel) = parse_module_ref(label, id).map_err(|message| {
      LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
        "invalid prelude label '{}': {}",
        label, message
      )))
      .for_package(id)
    })?;
    let root = match lookup::repo_root(&self.workspace_root, &repo, env)? {
      RepoRoot::Pending => return Ok(Outcome::Pending),
      RepoRoot::Found(root) => root,
      RepoRoot::Missing(message) => {
        return Err(
          LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
            "prelude '{}': {}",
            label, message
          )))
          .for_package(id),
        );
      }
    };
    match env
      .lookup(&GraphKey::ModuleSource(RootedPath::new(root, rel)))
      .map_err(|error| {
        LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
          "error loading prelude '{}': {}",
          label, error.kind
        )))
        .for_package(id)
      })? {
      Outcome::Pending => Ok(Outcome::Pending),
      Outcome::Ready(value) => value
        .as_module_source()
        .cloned()
        .map(Outcome::Ready)
        .ok_or_else(|| internal("module source produced a foreign value")),
    }
  }

  /// Resolve every statically-declared module reference in one batch.
  /// A single reference failure fails the construction, wrapped with the
  /// requesting file's identity, but only after the whole batch has been
  /// issued so sibling resolutions are already underway.
  fn modules_stage(
    &self,
    id: &PackageId,
    compiled: &CompiledPkgFile,
    env: &mut dyn GraphEnv,
  ) -> Result<Outcome<BTreeMap<String, Arc<ModuleSource>>>, LoadError> {
    let CompiledPkgFile::Compiled { scan, .. } = compiled else {
      return Ok(Outcome::Ready(BTreeMap::new()));
    };
    if scan.imports.is_empty() {
      return Ok(Outcome::Ready(BTreeMap::new()));
    }

    let mut keyed: Vec<(String, GraphKey)> = Vec::with_capacity(scan.imports.len());
    for import in &scan.imports {
      let (repo, rel) = parse_module_ref(&import.path, id).map_err(|message| {
        LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
          "invalid import '{}' at {}: {}",
          import.path, import.location, message
        )))
        .for_package(id)
      })?;
      let root = match lookup::repo_root(&self.workspace_root, &repo, env)? {
        RepoRoot::Pending => return Ok(Outcome::Pending),
        RepoRoot::Found(root) => root,
        RepoRoot::Missing(message) => {
          return Err(
            LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
              "import '{}': {}",
              import.path, message
            )))
            .for_package(id),
          );
        }
      };
      keyed.push((import.path.clone(), GraphKey::ModuleSource(RootedPath::new(root, rel))));
    }

    let keys: Vec<GraphKey> = keyed.iter().map(|(_, key)| key.clone()).collect();
    let batch = env.batch_lookup(&keys);

    for (path, key) in &keyed {
      if let Some(Err(error)) = batch.entries.get(key) {
        return Err(
          LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
            "in package '{}': cannot load module '{}': {}",
            id, path, error.kind
          )))
          .for_package(id),
        );
      }
    }
    if !batch.missing.is_empty() {
      return Ok(Outcome::Pending);
    }

    let mut modules = BTreeMap::new();
    for (path, key) in keyed {
      let Some(Ok(value)) = batch.entries.get(&key) else {
        continue;
      };
      let module = value
        .as_module_source()
        .cloned()
        .ok_or_else(|| internal("module source produced a foreign value"))?;
      modules.insert(path, module);
    }
    Ok(Outcome::Ready(modules))
  }

  /// Run the program. Synchronous and non-suspending: glob calls are
  /// satisfied by the hybrid globber's fallback path instead of by
  /// suspension.
  fn execute_stage(
    &self,
    id: &PackageId,
    root: &Root,
    build_file: &RootedPath,
    compiled: CompiledPkgFile,
    modules: BTreeMap<String, Arc<ModuleSource>>,
    env: &mut dyn GraphEnv,
  ) -> LoadedPackage {
    let mut builder = PackageBuilder::new(id.clone(), build_file.clone());

    match compiled {
      CompiledPkgFile::Failed { errors } => {
        // Execution is not attempted; the package reports its syntax
        // errors and nothing else.
        for error in &errors {
          builder.add_event(Event::error(
            error.location.map(|loc| (error.file.clone(), loc)),
            error.message.clone(),
          ));
        }
        builder.set_contains_errors();
        LoadedPackage {
          builder,
          glob_deps: BTreeSet::new(),
        }
      }
      CompiledPkgFile::Compiled { program, scan } => {
        builder.set_annotations(scan.annotations.clone());
        let globber = HybridGlobber::new(id.clone(), root.clone());
        let result = {
          let mut hooks = LoaderHooks {
            builder: &mut builder,
            globber: &globber,
            env,
            modules: &modules,
          };
          execute_program(&program.lua, &program.func, &program.env, &mut hooks)
        };
        if let Err(error) = result {
          builder.add_event(Event::error(
            None,
            format!("error evaluating package '{}': {}", id, error),
          ));
          builder.set_contains_errors();
        }
        LoadedPackage {
          glob_deps: globber.deps_requested(),
          builder,
        }
      }
    }
  }

  /// For every target whose directory differs from the package's own,
  /// verify via a containing-package lookup that the label does not cross
  /// into a different package. Violations degrade the one target and mark
  /// the package errored; they never abort the remaining targets.
  fn check_boundaries(
    &self,
    id: &PackageId,
    builder: &mut PackageBuilder,
    env: &mut dyn GraphEnv,
  ) -> Result<(), LoadError> {
    let pkg_dir = id.path().clone();
    let mut keyed = Vec::new();
    for label in builder.indexed_labels() {
      let dir = label.containing_dir();
      if dir == pkg_dir {
        continue;
      }
      let dir_id = PackageId::new(id.repo().clone(), dir, false);
      keyed.push((label, GraphKey::ContainingPackage(dir_id)));
    }
    if keyed.is_empty() {
      return Ok(());
    }

    let keys: Vec<GraphKey> = keyed.iter().map(|(_, key)| key.clone()).collect();
    let batch = env.batch_lookup(&keys);
    if !batch.missing.is_empty() {
      // Piggyback on the caller's missing-values check; no early restart.
      return Ok(());
    }

    for (label, key) in keyed {
      let containing = match batch.entries.get(&key) {
        Some(Ok(value)) => value
          .as_containing_package()
          .cloned()
          .ok_or_else(|| internal("containing-package lookup produced a foreign value"))?,
        Some(Err(error)) if matches!(error.kind, LoadErrorKind::InconsistentFilesystem(_)) => {
          return Err(error.clone().for_package(id));
        }
        Some(Err(error)) => {
          builder.add_event(Event::error(None, error.to_string()));
          builder.remove_target(&label);
          builder.set_contains_errors();
          continue;
        }
        None => continue,
      };

      let Some(containing) = containing else {
        // No package contains that directory. A problem somewhere, but
        // not a boundary violation of this package.
        continue;
      };
      if containing == label.pkg {
        continue;
      }
      if !containing.path().starts_with(label.pkg.path()) {
        // The containing package should extend the label's package: for
        // //a/b:c/d it could be //a/b/c or //a/b, never //a. When it
        // doesn't, the label points at an imaginary package; tolerated
        // here because earlier checks normally catch it.
        continue;
      }
      builder.add_event(Event::error(
        None,
        format!(
          "label '{}' crosses the boundary of subpackage '{}'; \
           targets must be declared in the package that owns their directory",
          label, containing
        ),
      ));
      builder.remove_target(&label);
      builder.set_contains_errors();
    }
    Ok(())
  }

  /// Re-request every recorded glob key and classify failures: symlink
  /// issues win over generic IO, and an IO error that execution did not
  /// see is a filesystem inconsistency.
  fn handle_glob_deps(
    &self,
    id: &PackageId,
    glob_deps: &BTreeSet<GraphKey>,
    package_was_in_error: bool,
    env: &mut dyn GraphEnv,
  ) -> Result<(), LoadError> {
    if glob_deps.is_empty() {
      return Ok(());
    }
    let keys: Vec<GraphKey> = glob_deps.iter().cloned().collect();
    let batch = env.batch_lookup(&keys);

    let mut symlink_issue: Option<LoadError> = None;
    for key in &keys {
      let Some(Err(error)) = batch.entries.get(key) else {
        continue;
      };
      match &error.kind {
        LoadErrorKind::InconsistentFilesystem(_) => {
          return Err(error.clone().for_package(id));
        }
        LoadErrorKind::SymlinkCycle(_) => {
          // Graph-side globbing detects symlink issues explicitly, so we
          // can report them precisely and treat them as non-transient.
          symlink_issue = Some(error.clone());
        }
        _ => {
          if !package_was_in_error {
            return Err(
              LoadError::transient(LoadErrorKind::InconsistentFilesystem(format!(
                "encountered error '{}' during glob re-evaluation \
                 but not when doing the same work earlier in this build",
                error.kind
              )))
              .for_package(id),
            );
          }
        }
      }
    }
    match symlink_issue {
      Some(error) => Err(error.for_package(id)),
      None => Ok(()),
    }
  }
}

impl GraphFns for Arc<Loader> {
  fn compute(&self, key: &GraphKey, env: &mut dyn GraphEnv) -> Result<Outcome<GraphValue>, LoadError> {
    GraphFns::compute(&**self, key, env)
  }
}

impl GraphFns for Loader {
  fn compute(&self, key: &GraphKey, env: &mut dyn GraphEnv) -> Result<Outcome<GraphValue>, LoadError> {
    match key {
      GraphKey::Package(id) => self.package_fn(id, env),
      GraphKey::PackageLookup(id) => lookup::package_lookup_fn(&self.workspace_root, id, env),
      GraphKey::ContainingPackage(id) => lookup::containing_package_fn(&self.workspace_root, id, env),
      GraphKey::FileState(path) => resolve::file_state_fn(path),
      GraphKey::VirtualFileState(path) => resolve::virtual_file_state_fn(&self.workspace_root, path, env),
      GraphKey::VirtualFileContent(path) => resolve::virtual_file_content_fn(&self.workspace_root, path, env),
      GraphKey::Glob(descriptor) => globber::glob_fn(descriptor),
      GraphKey::ModuleSource(path) => resolve::module_source_fn(path, env),
      GraphKey::WorkspaceConfig(index) => workspace::workspace_config_fn(&self.workspace_root, *index, env),
    }
  }
}

fn internal(message: &str) -> LoadError {
  LoadError::persistent(LoadErrorKind::Io(message.to_string()))
}

/// The execution hooks wiring the Lua runtime back into this construction.
struct LoaderHooks<'a> {
  builder: &'a mut PackageBuilder,
  globber: &'a HybridGlobber,
  env: &'a mut dyn GraphEnv,
  modules: &'a BTreeMap<String, Arc<ModuleSource>>,
}

impl LoaderHooks<'_> {
  fn run_glob(&mut self, args: &GlobArgs, op: GlobOperation) -> Result<Vec<String>, String> {
    let token = self
      .globber
      .begin(self.env, &args.include, &args.exclude, op, args.allow_empty)
      .map_err(|failure| self.note_glob_failure(failure))?;
    let matches = self
      .globber
      .resolve(token)
      .map_err(|failure| self.note_glob_failure(failure))?;
    Ok(matches.into_iter().collect())
  }

  fn note_glob_failure(&mut self, failure: GlobFailure) -> String {
    let message = failure.to_string();
    if failure.is_io() {
      self.builder.set_io_failure(failure);
    }
    message
  }
}

impl ExecHooks for LoaderHooks<'_> {
  fn register_target(&mut self, decl: TargetDecl) -> Result<(), String> {
    self.builder.add_target(decl)
  }

  fn glob(&mut self, args: GlobArgs) -> Result<Vec<String>, String> {
    let op = if args.dirs {
      GlobOperation::FilesAndDirs
    } else {
      GlobOperation::Files
    };
    self.run_glob(&args, op)
  }

  fn subpackages(&mut self, args: GlobArgs) -> Result<Vec<String>, String> {
    self.run_glob(&args, GlobOperation::Subpackages)
  }

  fn module_source(&mut self, path: &str) -> Result<ModuleChunk, String> {
    match self.modules.get(path) {
      Some(module) => {
        let source = String::from_utf8(module.bytes.clone())
          .map_err(|_| format!("module '{}' is not valid UTF-8", path))?;
        Ok(ModuleChunk {
          name: module.path.rel.clone(),
          source,
        })
      }
      None => Err(format!(
        "import(\"{}\") does not correspond to a literal import in this file; \
         import paths must be literal strings",
        path
      )),
    }
  }
}
