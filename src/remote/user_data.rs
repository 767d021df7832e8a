//! Cloud-init user data that mounts the shared packs file system.

use super::script::HOME_DIR;

const MOUNT_OPTIONS: &str =
    "nfsvers=4.1,rsize=1048576,wsize=1048576,hard,timeo=600,retrans=2,noresvport";

/// Renders `#cloud-config` user data mounting `efs_dns_name:/packs_dir` over
/// the login user's packs directory.
#[must_use]
pub fn efs_packs(efs_dns_name: &str, packs_dir: &str) -> String {
    let file_system_id = efs_dns_name.split('.').next().unwrap_or(efs_dns_name);
    let lines = [
        String::from("#cloud-config"),
        String::from("package_update: false"),
        String::from("package_upgrade: false"),
        String::from("runcmd:"),
        format!("- ubuntu_folder={HOME_DIR}"),
        String::from("- efs_mount_point_1=/mnt/efs/fs1"),
        format!("- file_system_id_1={file_system_id}"),
        format!("- efs_dns_name={efs_dns_name}"),
        format!("- pack_folder={packs_dir}"),
        String::from("- yum install -y amazon-efs-utils"),
        String::from("- apt-get -y install amazon-efs-utils"),
        String::from("- yum install -y nfs-utils"),
        String::from("- apt-get -y install nfs-common"),
        String::from("- mkdir -p \"${efs_mount_point_1}\""),
        format!(
            "- test -f \"/sbin/mount.efs\" && printf \"\\n${{file_system_id_1}}:/ ${{efs_mount_point_1}} efs tls,_netdev\\n\" >> /etc/fstab || printf \"\\n${{efs_dns_name}}:/ ${{efs_mount_point_1}} nfs4 {MOUNT_OPTIONS},_netdev 0 0\\n\" >> /etc/fstab"
        ),
        String::from(
            "- test -f \"/sbin/mount.efs\" && grep -ozP 'client-info]\\nsource' '/etc/amazon/efs/efs-utils.conf'; if [[ $? == 1 ]]; then printf \"\\n[client-info]\\nsource=liw\\n\" >> /etc/amazon/efs/efs-utils.conf; fi;",
        ),
        String::from(
            "- retryCnt=15; waitTime=30; while true; do mount -a -t efs,nfs4 defaults; if [ $? = 0 ] || [ $retryCnt -lt 1 ]; then echo File system mounted successfully; break; fi; echo File system not available, retrying to mount.; ((retryCnt--)); sleep $waitTime; done;",
        ),
        String::from("- rm -rf \"${ubuntu_folder}/${pack_folder}\""),
        String::from("- mkdir -p \"${ubuntu_folder}/${pack_folder}\""),
        String::from("- chown -R ubuntu:ubuntu \"${ubuntu_folder}/${pack_folder}\""),
        format!(
            "- mount -t nfs -o {MOUNT_OPTIONS} ${{efs_dns_name}}:/${{pack_folder}} ${{ubuntu_folder}}/${{pack_folder}}"
        ),
        format!(
            "- printf \"\\n${{efs_dns_name}}:/${{pack_folder}} ${{ubuntu_folder}}/${{pack_folder}} nfs4 {MOUNT_OPTIONS},_netdev 0 0\\n\" >> /etc/fstab"
        ),
    ];
    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}
