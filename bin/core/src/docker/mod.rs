use std::{collections::HashMap, sync::OnceLock};

use anyhow::Context;
use bollard::Docker;
use bollard::query_parameters::{
  ListContainersOptions, ListServicesOptions, ListVolumesOptions,
  RemoveVolumeOptions,
};

use crate::config::core_config;

pub mod compose;

/// Label schema stamped on every managed service. Read back by
/// change detection and the destroy stage.
pub mod labels {
  /// Value is [super::MANAGER_NAME].
  pub const MANAGER: &str = "manager";
  /// Repository full name, host stripped: `owner/repo`.
  pub const REPOSITORY_NAME: &str = "repository.name";
  pub const COMMIT_SHA: &str = "deployment.commit_sha";
  pub const EXTERNAL_SECRETS_HASH: &str =
    "deployment.external_secrets_hash";
  pub const TRIGGER: &str = "deployment.trigger";
  pub const APP_VERSION: &str = "deployment.manager_version";
}

/// The value of the `manager` label on services owned by this
/// system.
pub const MANAGER_NAME: &str = "doco-cd";

pub fn docker_client() -> &'static DockerClient {
  static DOCKER_CLIENT: OnceLock<DockerClient> = OnceLock::new();
  DOCKER_CLIENT.get_or_init(Default::default)
}

pub struct DockerClient {
  docker: Docker,
}

impl Default for DockerClient {
  fn default() -> DockerClient {
    DockerClient {
      docker: Docker::connect_with_defaults()
        .expect("failed to connect to docker daemon"),
    }
  }
}

impl DockerClient {
  /// Label maps of the project's current services. Empty when the
  /// stack does not exist. Swarm mode reads service labels,
  /// otherwise container labels.
  pub async fn service_labels(
    &self,
    project: &str,
  ) -> anyhow::Result<Vec<HashMap<String, String>>> {
    if core_config().swarm_mode {
      let services = self
        .docker
        .list_services(Option::<ListServicesOptions>::None)
        .await
        .context("failed to list swarm services")?;
      Ok(
        services
          .into_iter()
          .filter_map(|service| {
            let labels = service.spec?.labels?;
            (labels.get("com.docker.stack.namespace").map(String::as_str)
              == Some(project))
            .then_some(labels)
          })
          .collect(),
      )
    } else {
      Ok(
        self
          .project_containers(project)
          .await?
          .into_iter()
          .filter_map(|container| container.labels)
          .collect(),
      )
    }
  }

  /// Current image ids of the project's containers, used by the
  /// force-image-pull change signal.
  pub async fn image_ids(
    &self,
    project: &str,
  ) -> anyhow::Result<Vec<String>> {
    let mut ids = self
      .project_containers(project)
      .await?
      .into_iter()
      .filter_map(|container| container.image_id)
      .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    Ok(ids)
  }

  /// Removes volumes labeled as belonging to the project and
  /// managed by doco-cd. Only used for swarm destroys, where
  /// `down --volumes` is not available.
  pub async fn remove_labeled_volumes(
    &self,
    project: &str,
  ) -> anyhow::Result<Vec<String>> {
    let volumes = self
      .docker
      .list_volumes(Option::<ListVolumesOptions>::None)
      .await
      .context("failed to list volumes")?
      .volumes
      .unwrap_or_default();
    let mut removed = Vec::new();
    for volume in volumes {
      let labels = &volume.labels;
      let managed = labels.get(labels::MANAGER).map(String::as_str)
        == Some(MANAGER_NAME)
        || labels
          .get("com.docker.stack.namespace")
          .map(String::as_str)
          == Some(project);
      if !managed {
        continue;
      }
      self
        .docker
        .remove_volume(
          &volume.name,
          Option::<RemoveVolumeOptions>::None,
        )
        .await
        .with_context(|| {
          format!("failed to remove volume {}", volume.name)
        })?;
      removed.push(volume.name);
    }
    Ok(removed)
  }

  async fn project_containers(
    &self,
    project: &str,
  ) -> anyhow::Result<
    Vec<bollard::models::ContainerSummary>,
  > {
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions {
        all: true,
        ..Default::default()
      }))
      .await
      .context("failed to list containers")?;
    Ok(
      containers
        .into_iter()
        .filter(|container| {
          container
            .labels
            .as_ref()
            .and_then(|labels| {
              labels.get("com.docker.compose.project")
            })
            .map(String::as_str)
            == Some(project)
        })
        .collect(),
    )
  }
}

/// One managed compose project as reported by the read API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagedStack {
  pub name: String,
  pub repository: String,
  pub commit_sha: String,
  #[serde(skip_serializing_if = "String::is_empty")]
  pub external_secrets_hash: String,
  pub services: usize,
}

impl DockerClient {
  /// Every compose project on the engine carrying the doco-cd
  /// manager label, grouped by project name.
  pub async fn managed_stacks(
    &self,
  ) -> anyhow::Result<Vec<ManagedStack>> {
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions {
        all: true,
        ..Default::default()
      }))
      .await
      .context("failed to list containers")?;
    let mut stacks: std::collections::BTreeMap<
      String,
      ManagedStack,
    > = Default::default();
    for container in containers {
      let Some(labels) = container.labels else {
        continue;
      };
      if labels.get(labels::MANAGER).map(String::as_str)
        != Some(MANAGER_NAME)
      {
        continue;
      }
      let Some(project) =
        labels.get("com.docker.compose.project").cloned()
      else {
        continue;
      };
      let entry = stacks
        .entry(project.clone())
        .or_insert_with(|| ManagedStack {
          name: project,
          repository: labels
            .get(labels::REPOSITORY_NAME)
            .cloned()
            .unwrap_or_default(),
          commit_sha: labels
            .get(labels::COMMIT_SHA)
            .cloned()
            .unwrap_or_default(),
          external_secrets_hash: labels
            .get(labels::EXTERNAL_SECRETS_HASH)
            .cloned()
            .unwrap_or_default(),
          services: 0,
        });
      entry.services += 1;
    }
    Ok(stacks.into_values().collect())
  }
}

/// First value of the label across the service set, if any
/// service carries it.
pub fn label_value<'a>(
  labels: &'a [HashMap<String, String>],
  key: &str,
) -> Option<&'a str> {
  labels
    .iter()
    .find_map(|map| map.get(key))
    .map(String::as_str)
}
