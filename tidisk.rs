// Copyright © 2023 David Caldwell <david@porkrind.org>

use std::path::PathBuf;

use tidisk::block::ImageFormat;
use tidisk::ops::*;

use anyhow::anyhow;
use docopt::Docopt;
use serde::Deserialize;
use strum::VariantNames;

fn usage() -> String {
    format!(r#"
Usage:
  tidisk -h
  tidisk [-h] -i <image> ls [-l]
  tidisk [-h] -i <image> cp <source-file> <dest-file>
  tidisk [-h] -i <image> rm <file>
  tidisk [-h] -i <image> cat <file>
  tidisk [-h] -i <image> mkfs <disk-type> <name>
  tidisk [-h] -i <image> dump [--sector] [<file>]
  tidisk [-h] -i <image> dump-vib
  tidisk [-h] -i <image> check
  tidisk [-h] -i <image> convert <image-type> <dest-file>

Options:
  -h --help              Show this screen.
  -i --image <image>     Use <image> as the disk image. A CF7 card image takes a
                         volume number suffix: `card.img#2` (volumes start at 1).

 ls:
   -l --long             Also show protection, timestamps and each file's sector runs.

   List files in the image, including any subdirectories.

 cp:
   <source-file> and <dest-file> specify local (host) filesystem paths if they
   contain a `/` character. Otherwise they specify files on the image. The
   filenames will be converted to uppercase for convenience. A file in a
   subdirectory is named `DIR.FILE`. A plain `.` in the <dest-file> means the
   same name as the <source-file>, but inside the image (use `./` for the local
   filesystem). Files copied into the image are stored as PROGRAM files.

   Examples:
     # These both copy 'hello' from the local machine into the disk image (as HELLO):
     tidisk -i games.dsk cp ./hello hello
     tidisk -i games.dsk cp ./hello .

     # This copies 'HELLO' from the disk image into /tmp/HELLO on the local machine:
     tidisk -i games.dsk cp HELLO /tmp

 rm:
   <file> will be deleted from the image.

 cat:
   Prints the contents of <file> to stdout.

 dump:
   -s --sector           Dump logical sectors instead of raw tracks.

   Dumps the image. If <file> is specified, dumps the file's FDR and sectors instead.

 dump-vib:
   Shows the Volume Information Block, including the allocation bitmap.

 check:
   Cross checks every file against the allocation bitmap.

 mkfs:
   Creates a new, empty image. The <image> file specified by `-i` must _not_
   already exist (unless it is a CF7 card, in which case the volume is replaced).
   The image type comes from the extension (.dsk, .pc99, .ana, .cf7).

   <disk-type> must be one of: {}

 convert:
   Convert the image to a different image file type.

   <image-type> must be one of: {}
"#,
    DiskType::VARIANTS.join(", "),
    ImageFormat::VARIANTS.iter().map(|s| *s).filter(|t| *t != "unknown").collect::<Vec<&str>>().join(", "))
}

#[derive(Debug, Deserialize)]
struct Args {
    flag_image:       PathBuf,
    flag_sector:      bool,
    flag_long:        bool,
    cmd_ls:           bool,
    cmd_cp:           bool,
    cmd_rm:           bool,
    cmd_dump:         bool,
    cmd_dump_vib:     bool,
    cmd_check:        bool,
    cmd_mkfs:         bool,
    cmd_cat:          bool,
    cmd_convert:      bool,
    arg_source_file:  PathBuf,
    arg_dest_file:    PathBuf,
    arg_file:         Option<PathBuf>,
    arg_name:         Option<String>,
    arg_disk_type:    Option<DiskType>,
    arg_image_type:   Option<ImageFormat>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = Docopt::new(usage())
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    // Do this very early since we normally die if the image file doesn't exist
    if args.cmd_mkfs {
        let dtype = args.arg_disk_type.ok_or(anyhow!("Missing <disk-type>"))?;
        let name = args.arg_name.ok_or(anyhow!("Missing <name>"))?;
        return mkfs(&args.flag_image, dtype, &name);
    }

    let media = open_media(&args.flag_image)?;
    let format = media.borrow().format();

    // Do this early so we can dump unformatted images (since DiskFs::open() will die).
    if args.cmd_dump && args.arg_file.is_none() {
        return dump(&media, args.flag_sector);
    }

    if args.cmd_dump_vib {
        return dump_vib(&media);
    }

    if args.cmd_convert {
        return convert(&media, args.arg_image_type.ok_or(anyhow!("Missing <image-type>"))?, &args.arg_dest_file);
    }

    let mut fs = open_fs(&media)?;

    if args.cmd_ls {
        ls(&fs, args.flag_long)?;
    }

    if args.cmd_check {
        check(&fs)?;
    }

    if args.cmd_cp {
        match (args.arg_source_file.to_string_lossy().chars().find(|c| std::path::is_separator(*c)).is_some(),
               args.arg_dest_file  .to_string_lossy().chars().find(|c| std::path::is_separator(*c)).is_some()) {
            (false, true)  => cp_from_image(&fs, &args.arg_source_file, &args.arg_dest_file)?,
            (true,  false) => { cp_into_image(&mut fs, &args.arg_source_file, &args.arg_dest_file)?;
                                save_image(&media, &args.flag_image, format)? },
            (false, false) => Err(anyhow!("Image to image copy is not supported yet."))?,
            (true,  true)  => Err(anyhow!("Either the source or destination file needs to be on the image"))?,
        }
    }

    if args.cmd_rm {
        rm(&mut fs, &args.arg_file.ok_or(anyhow!("Missing <file>"))?)?;
        save_image(&media, &args.flag_image, format)?;
        return Ok(())
    }

    if args.cmd_dump {
        if let Some(file) = args.arg_file {
            dump_file(&fs, &file)?;
        }
        return Ok(())
    }

    if args.cmd_cat {
        use std::io::Write;
        let data = cat(&fs, &args.arg_file.ok_or(anyhow!("Missing <file>"))?)?;
        std::io::stdout().write_all(&data)?;
    }

    Ok(())
}
